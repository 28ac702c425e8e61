//! MMIO 寄存器访问
//!
//! 门铃寄存器是设备寄存器，不是普通内存：每次写入都必须以一次完整的
//! 32 位存储到达设备，且必须排在之前所有队列条目写入之后。

use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::dma::IoAddr;
use crate::{DriverError, Result};

/// MMIO 区域
///
/// 已映射到当前地址空间的设备寄存器窗口。
pub struct MmioRegion {
    /// 虚拟地址
    base: NonNull<u8>,
    /// 大小
    size: usize,
    /// 寄存器窗口在主机 I/O 空间中的地址
    phys_addr: IoAddr,
    /// 寄存器存储的所有者，派生的门铃各持有一份
    owner: Option<Arc<dyn Send + Sync>>,
}

impl MmioRegion {
    /// 由已经映射好的寄存器窗口构造
    ///
    /// # 安全性
    /// `base` 开始的 `size` 字节必须在区域及其派生的 [`Doorbell`] 存活期间一直有效，
    /// 且按 4 字节对齐。
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize, phys_addr: IoAddr) -> Result<Self> {
        if size == 0 || base.as_ptr() as usize % 4 != 0 {
            return Err(DriverError::InvalidArgument);
        }
        Ok(Self {
            base,
            size,
            phys_addr,
            owner: None,
        })
    }

    /// 由 `owner` 持有的寄存器存储构造
    ///
    /// 区域和派生的每个 [`Doorbell`] 都持有 `owner`，存储在最后一个持有者
    /// 释放之前一直有效。
    ///
    /// # 安全性
    /// `base` 开始的 `size` 字节必须属于 `owner`，在 `owner` 存活期间一直有效，
    /// 且按 4 字节对齐。
    pub unsafe fn with_owner(
        base: NonNull<u8>,
        size: usize,
        phys_addr: IoAddr,
        owner: Arc<dyn Send + Sync>,
    ) -> Result<Self> {
        let mut region = unsafe { Self::from_raw(base, size, phys_addr)? };
        region.owner = Some(owner);
        Ok(region)
    }

    /// 获取基地址
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// 获取大小
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// 获取主机 I/O 地址
    #[inline]
    pub fn phys_addr(&self) -> IoAddr {
        self.phys_addr
    }

    /// 主机 I/O 地址是否落在该窗口内
    #[inline]
    pub fn contains(&self, addr: IoAddr) -> bool {
        addr.as_u64() >= self.phys_addr.as_u64()
            && addr.as_u64() - self.phys_addr.as_u64() < self.size as u64
    }

    fn reg32(&self, offset: usize) -> Result<&AtomicU32> {
        if offset % 4 != 0 || offset + 4 > self.size {
            return Err(DriverError::InvalidArgument);
        }
        Ok(unsafe { AtomicU32::from_ptr(self.base.as_ptr().add(offset) as *mut u32) })
    }

    /// 读取 32 位寄存器
    #[inline]
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        Ok(self.reg32(offset)?.load(Ordering::Acquire))
    }

    /// 写入 32 位寄存器
    #[inline]
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.reg32(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// 取得偏移 `offset` 处的门铃寄存器
    pub fn doorbell(&self, offset: usize) -> Result<Doorbell> {
        let reg = NonNull::from(self.reg32(offset)?);
        Ok(Doorbell {
            reg,
            host_addr: self.phys_addr.add(offset),
            _owner: self.owner.clone(),
        })
    }
}

unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

/// 门铃寄存器
///
/// 只能被整体写入；调用 [`Doorbell::ring`] 前写入的所有队列条目都对设备可见。
pub struct Doorbell {
    reg: NonNull<AtomicU32>,
    host_addr: IoAddr,
    _owner: Option<Arc<dyn Send + Sync>>,
}

impl Doorbell {
    /// 通知设备新的队列指针
    #[inline]
    pub fn ring(&self, value: u16) {
        fence(Ordering::SeqCst);
        unsafe { self.reg.as_ref() }.store(value as u32, Ordering::Release);
    }

    /// 门铃在主机 I/O 空间中的原始地址
    #[inline]
    pub fn host_addr(&self) -> IoAddr {
        self.host_addr
    }

    /// 读回最后写入的值
    #[inline]
    pub fn value(&self) -> u32 {
        unsafe { self.reg.as_ref() }.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Doorbell")
            .field("host_addr", &self.host_addr)
            .finish()
    }
}

unsafe impl Send for Doorbell {}
unsafe impl Sync for Doorbell {}

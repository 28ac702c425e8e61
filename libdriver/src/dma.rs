//! DMA 内存管理
//!
//! 描述设备可直接访问的内存区域：一个 CPU/GPU 侧可用的虚拟地址，
//! 以及每个 I/O 页对应的总线地址。区域本身由外部的 [`DmaProvider`] 分配。

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

use crate::{DriverError, Result};

/// 设备要求的 DMA 对齐 (64 KiB)
pub const DMA_ALIGNMENT: usize = 0x10000;

/// 设备可见的 I/O 地址（总线地址）
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoAddr(pub u64);

impl IoAddr {
    pub const NULL: IoAddr = IoAddr(0);

    #[inline]
    pub fn new(addr: u64) -> Self {
        IoAddr(addr)
    }

    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn add(&self, offset: usize) -> Self {
        IoAddr(self.0 + offset as u64)
    }
}

impl fmt::Display for IoAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 将 `size` 向上对齐到 `alignment`（必须是 2 的幂）
#[inline]
pub const fn page_align(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

bitflags! {
    /// DMA 分配选项
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaOptions: u32 {
        /// 分配后清零
        const ZERO = 1 << 0;
        /// 要求 I/O 地址连续
        const CONTIGUOUS = 1 << 1;
        /// 优先放在设备本地内存（例如 GPU 显存）
        const DEVICE_LOCAL = 1 << 2;
    }
}

/// 多节点共享设备时的拓扑参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Topology {
    /// 互连适配器编号
    pub adapter: u32,
    /// 共享内存段 ID
    pub segment_id: u32,
}

/// DMA 区域提供者
///
/// 分配可作为设备 DMA 目标的内存，并为每一页给出 I/O 地址。
pub trait DmaProvider {
    /// 为 `device_id` 分配至少 `size` 字节的 DMA 区域
    fn allocate(
        &self,
        size: usize,
        device_id: u32,
        topology: Option<&Topology>,
        options: DmaOptions,
    ) -> Result<DmaRegion>;
}

/// 区域释放回调，参数为虚拟地址与大小
pub type ReleaseFn = Box<dyn FnOnce(NonNull<u8>, usize) + Send + Sync>;

/// DMA 内存区域
///
/// 设备可能在任意时刻写入该内存，因此不提供覆盖整个区域的引用，
/// 所有访问都以原始指针按范围进行。
pub struct DmaRegion {
    /// 虚拟地址
    virt_addr: NonNull<u8>,
    /// 大小
    size: usize,
    /// I/O 页大小
    page_size: usize,
    /// 每个 I/O 页的总线地址
    io_addrs: Vec<IoAddr>,
    /// 释放回调
    release: Option<ReleaseFn>,
}

impl DmaRegion {
    /// 由提供者已经分配并映射好的内存构造区域
    ///
    /// # 安全性
    /// `virt_addr` 必须指向至少 `size` 字节、在区域存活期间一直有效的内存，
    /// `io_addrs[i]` 必须是第 `i` 页在设备地址空间中的地址。
    pub unsafe fn from_raw_parts(
        virt_addr: NonNull<u8>,
        size: usize,
        page_size: usize,
        io_addrs: Vec<IoAddr>,
        release: Option<ReleaseFn>,
    ) -> Result<Self> {
        if size == 0 || page_size == 0 || !page_size.is_power_of_two() {
            return Err(DriverError::InvalidArgument);
        }
        if io_addrs.len() != size.div_ceil(page_size) {
            log::error!(
                "dma: {} io addresses given for {} pages",
                io_addrs.len(),
                size.div_ceil(page_size)
            );
            return Err(DriverError::InvalidArgument);
        }

        Ok(Self {
            virt_addr,
            size,
            page_size,
            io_addrs,
            release,
        })
    }

    /// 获取虚拟地址
    #[inline]
    pub fn virt_addr(&self) -> *mut u8 {
        self.virt_addr.as_ptr()
    }

    /// 获取大小
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// 获取 I/O 页大小
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.io_addrs.len()
    }

    /// 所有页的 I/O 地址
    #[inline]
    pub fn io_addrs(&self) -> &[IoAddr] {
        &self.io_addrs
    }

    /// 区域起始处的 I/O 地址
    #[inline]
    pub fn io_addr(&self) -> IoAddr {
        self.io_addrs[0]
    }

    /// 从偏移处获取 I/O 地址
    #[inline]
    pub fn io_addr_at(&self, offset: usize) -> Option<IoAddr> {
        if offset < self.size {
            let page = offset / self.page_size;
            Some(self.io_addrs[page].add(offset % self.page_size))
        } else {
            None
        }
    }

    /// `[offset, offset + len)` 是否落在同一个 I/O 页内
    #[inline]
    pub fn within_page(&self, offset: usize, len: usize) -> bool {
        len != 0
            && offset + len <= self.size
            && offset / self.page_size == (offset + len - 1) / self.page_size
    }

    /// 清零
    pub fn zero(&mut self) {
        unsafe {
            core::ptr::write_bytes(self.virt_addr.as_ptr(), 0, self.size);
        }
    }

    /// 从区域复制数据到 `buf`
    ///
    /// 调用者需要保证设备此时不再写入这段范围。
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.virt_addr.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// 将 `data` 写入区域
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.virt_addr.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(DriverError::BufferTooSmall),
        }
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("virt_addr", &self.virt_addr)
            .field("size", &self.size)
            .field("page_size", &self.page_size)
            .field("io_addr", &self.io_addrs.first())
            .finish()
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.virt_addr, self.size);
        }
    }
}

// 实现 Send 和 Sync
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

#[cfg(test)]
pub(crate) mod test {
    use alloc::alloc::{alloc_zeroed, dealloc, Layout};
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use core::ptr::NonNull;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{page_align, DmaRegion, IoAddr, DMA_ALIGNMENT};
    use crate::DriverError;

    /// 在堆上分配一个区域，页 `i` 的 I/O 地址为 `io_base + i * 0x10_0000`
    pub(crate) fn heap_region(size: usize, page_size: usize, io_base: u64) -> DmaRegion {
        let layout = Layout::from_size_align(size, page_size).unwrap();
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
        let io_addrs: Vec<IoAddr> = (0..size.div_ceil(page_size))
            .map(|page| IoAddr::new(io_base + page as u64 * 0x10_0000))
            .collect();
        unsafe {
            DmaRegion::from_raw_parts(
                ptr,
                size,
                page_size,
                io_addrs,
                Some(Box::new(move |ptr: NonNull<u8>, _| {
                    dealloc(ptr.as_ptr(), layout)
                })),
            )
        }
        .unwrap()
    }

    #[test]
    fn page_align_rounds_to_dma_alignment() {
        assert_eq!(page_align(1, DMA_ALIGNMENT), DMA_ALIGNMENT);
        assert_eq!(page_align(DMA_ALIGNMENT, DMA_ALIGNMENT), DMA_ALIGNMENT);
        assert_eq!(page_align(2 * 4096 * 32, DMA_ALIGNMENT), 4 * DMA_ALIGNMENT);
        assert_eq!(page_align(0, 4096), 0);
    }

    #[test]
    fn io_addr_follows_page_table() {
        let region = heap_region(3 * 4096, 4096, 0x8000_0000);

        assert_eq!(region.page_count(), 3);
        assert_eq!(region.io_addr(), IoAddr::new(0x8000_0000));
        assert_eq!(region.io_addr_at(4096 + 16), Some(IoAddr::new(0x8010_0010)));
        assert_eq!(region.io_addr_at(3 * 4096), None);
        assert!(region.within_page(4096, 4096));
        assert!(!region.within_page(4095, 2));
        assert!(!region.within_page(0, 0));
    }

    #[test]
    fn read_write_are_bounds_checked() {
        let mut region = heap_region(4096, 4096, 0);
        region.write(4090, &[1, 2, 3, 4, 5, 6]).unwrap();

        let mut buf = [0u8; 6];
        region.read(4090, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6]);

        assert_eq!(region.write(4091, &buf), Err(DriverError::BufferTooSmall));
        assert_eq!(region.read(usize::MAX, &mut buf), Err(DriverError::BufferTooSmall));

        region.zero();
        region.read(4090, &mut buf).unwrap();
        assert_eq!(buf, [0; 6]);
    }

    #[test]
    fn mismatched_page_table_is_rejected() {
        let mut backing = [0u8; 64];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();
        let result = unsafe { DmaRegion::from_raw_parts(ptr, 64, 32, Vec::new(), None) };
        assert_eq!(result.err(), Some(DriverError::InvalidArgument));
    }

    #[test]
    fn release_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let mut backing = [0u8; 64];
        let ptr = NonNull::new(backing.as_mut_ptr()).unwrap();

        let region = unsafe {
            DmaRegion::from_raw_parts(
                ptr,
                64,
                64,
                alloc::vec![IoAddr::new(0x1000)],
                Some(Box::new(move |_, size| {
                    counter.fetch_add(size, Ordering::SeqCst);
                })),
            )
        }
        .unwrap();
        drop(region);

        assert_eq!(released.load(Ordering::SeqCst), 64);
    }
}

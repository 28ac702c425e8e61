//! I/O 地址转换
//!
//! 记录 I/O 地址窗口到主机内存的映射，相当于一个简化的 IOMMU 页表。
//! 软件实现的设备通过它把命令中的总线地址转换回可访问的内存。

use alloc::collections::BTreeMap;
use core::ptr::NonNull;

use spin::{Mutex, RwLock};

use crate::dma::{page_align, IoAddr};
use crate::{DriverError, Result};

#[derive(Debug, Clone, Copy)]
struct Mapping {
    host: usize,
    len: usize,
}

/// I/O 地址映射表
pub struct IoMap {
    /// 起始 I/O 地址 -> 映射
    mappings: RwLock<BTreeMap<u64, Mapping>>,
    /// 下一个可分配的 I/O 地址
    next: Mutex<u64>,
}

impl IoMap {
    /// 创建映射表，I/O 地址从 `base` 开始分配
    pub fn new(base: IoAddr) -> Self {
        Self {
            mappings: RwLock::new(BTreeMap::new()),
            next: Mutex::new(base.as_u64()),
        }
    }

    /// 分配一段 `len` 字节、按 `alignment` 对齐的 I/O 地址窗口
    pub fn reserve(&self, len: usize, alignment: usize) -> IoAddr {
        let mut next = self.next.lock();
        let start = page_align(*next as usize, alignment) as u64;
        *next = start + page_align(len, alignment) as u64;
        IoAddr::new(start)
    }

    /// 建立映射
    ///
    /// # 安全性
    /// 在 [`IoMap::unmap`] 之前，`host` 开始的 `len` 字节必须一直有效。
    pub unsafe fn map(&self, io_addr: IoAddr, host: NonNull<u8>, len: usize) -> Result<()> {
        if len == 0 {
            return Err(DriverError::InvalidArgument);
        }
        let start = io_addr.as_u64();
        let end = start
            .checked_add(len as u64)
            .ok_or(DriverError::InvalidArgument)?;

        let mut mappings = self.mappings.write();

        // 与前后的映射都不能重叠
        if let Some((&prev, mapping)) = mappings.range(..=start).next_back() {
            if prev + mapping.len as u64 > start {
                return Err(DriverError::InvalidArgument);
            }
        }
        if let Some((&next, _)) = mappings.range(start..).next() {
            if next < end {
                return Err(DriverError::InvalidArgument);
            }
        }

        mappings.insert(
            start,
            Mapping {
                host: host.as_ptr() as usize,
                len,
            },
        );
        Ok(())
    }

    /// 删除以 `io_addr` 开始的映射
    pub fn unmap(&self, io_addr: IoAddr) -> bool {
        self.mappings.write().remove(&io_addr.as_u64()).is_some()
    }

    /// 将 `[io_addr, io_addr + len)` 转换为主机地址
    ///
    /// 整个范围必须落在同一个映射内。
    pub fn translate(&self, io_addr: IoAddr, len: usize) -> Option<NonNull<u8>> {
        let addr = io_addr.as_u64();
        let mappings = self.mappings.read();
        let (&start, mapping) = mappings.range(..=addr).next_back()?;

        let offset = (addr - start) as usize;
        if offset.checked_add(len)? > mapping.len {
            return None;
        }
        NonNull::new((mapping.host + offset) as *mut u8)
    }

    /// 当前映射数量
    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.read().is_empty()
    }
}

#[cfg(test)]
mod test {
    use core::ptr::NonNull;

    use super::IoMap;
    use crate::dma::IoAddr;
    use crate::DriverError;

    #[test]
    fn reserve_is_aligned_and_disjoint() {
        let map = IoMap::new(IoAddr::new(0x1_0000_1000));
        let a = map.reserve(100, 0x10000);
        let b = map.reserve(0x10000, 0x10000);
        let c = map.reserve(1, 0x1000);

        assert_eq!(a, IoAddr::new(0x1_0001_0000));
        assert_eq!(b, IoAddr::new(0x1_0002_0000));
        assert_eq!(c, IoAddr::new(0x1_0003_0000));
    }

    #[test]
    fn translate_stays_inside_one_mapping() {
        let mut memory = [0u8; 256];
        let host = NonNull::new(memory.as_mut_ptr()).unwrap();
        let map = IoMap::new(IoAddr::new(0x4000));

        unsafe { map.map(IoAddr::new(0x4000), host, 256) }.unwrap();

        let inner = map.translate(IoAddr::new(0x4010), 16).unwrap();
        assert_eq!(inner.as_ptr() as usize, host.as_ptr() as usize + 0x10);
        assert!(map.translate(IoAddr::new(0x40f0), 32).is_none());
        assert!(map.translate(IoAddr::new(0x3fff), 1).is_none());
        assert!(map.translate(IoAddr::new(0x4100), 1).is_none());

        assert!(map.unmap(IoAddr::new(0x4000)));
        assert!(map.translate(IoAddr::new(0x4000), 1).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn overlapping_mappings_are_rejected() {
        let mut memory = [0u8; 256];
        let host = NonNull::new(memory.as_mut_ptr()).unwrap();
        let map = IoMap::new(IoAddr::new(0));

        unsafe { map.map(IoAddr::new(0x1000), host, 128) }.unwrap();
        let overlap_tail = unsafe { map.map(IoAddr::new(0x1040), host, 16) };
        let overlap_head = unsafe { map.map(IoAddr::new(0x0ff0), host, 32) };
        let adjacent = unsafe { map.map(IoAddr::new(0x1080), host, 16) };

        assert_eq!(overlap_tail, Err(DriverError::InvalidArgument));
        assert_eq!(overlap_head, Err(DriverError::InvalidArgument));
        assert!(adjacent.is_ok());
        assert_eq!(map.len(), 2);
    }
}

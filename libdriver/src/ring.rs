//! 环形缓冲区
//!
//! 设备可见内存上的有界环，提交队列与完成队列共用同一实现。
//! 槽位存储 ([`RingSlots`]) 与头尾指针 ([`RingBuffer`]) 分开：
//! 前者可以被多个线程共享以写入互不相交的槽位，后者只属于一个维护者。

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;

use crate::dma::{DmaRegion, IoAddr};
use crate::{DriverError, Result};

/// 可以放入环形缓冲区的条目
///
/// # 安全性
/// 实现者必须是 `#[repr(C)]` 的纯数据类型：任意位模式都合法，不含指针或引用。
pub unsafe trait RingEntry: Copy + Send + 'static {}

/// 环形缓冲区的槽位
pub struct RingSlots<E> {
    /// 底层 DMA 区域
    region: Arc<DmaRegion>,
    /// 第 0 个槽位
    base: NonNull<E>,
    /// 区域内偏移
    offset: usize,
    /// 槽位数量（2 的幂）
    capacity: u16,
    /// 第 0 个槽位的 I/O 地址
    io_addr: IoAddr,
    _marker: PhantomData<E>,
}

impl<E: RingEntry> RingSlots<E> {
    /// 在 `region` 的 `offset` 处放置 `capacity` 个槽位
    pub fn new(region: Arc<DmaRegion>, offset: usize, capacity: u16) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(DriverError::InvalidArgument);
        }

        let bytes = capacity as usize * size_of::<E>();
        let end = offset.checked_add(bytes).ok_or(DriverError::InvalidArgument)?;
        if end > region.size() {
            return Err(DriverError::BufferTooSmall);
        }

        let addr = region.virt_addr() as usize + offset;
        if addr % align_of::<E>() != 0 {
            return Err(DriverError::InvalidArgument);
        }

        // 设备按物理连续访问整个环
        if !region.within_page(offset, bytes) {
            return Err(DriverError::InvalidArgument);
        }

        let io_addr = region
            .io_addr_at(offset)
            .ok_or(DriverError::InvalidArgument)?;
        let base = NonNull::new(addr as *mut E).ok_or(DriverError::InvalidArgument)?;

        Ok(Self {
            region,
            base,
            offset,
            capacity,
            io_addr,
            _marker: PhantomData,
        })
    }

    /// 槽位数量
    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// 第 0 个槽位的 I/O 地址
    #[inline]
    pub fn io_addr(&self) -> IoAddr {
        self.io_addr
    }

    /// 区域内偏移
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 底层 DMA 区域
    #[inline]
    pub fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    /// 将任意单调递增的序号折算为槽位下标
    #[inline]
    pub fn wrap(&self, index: usize) -> u16 {
        (index & (self.capacity as usize - 1)) as u16
    }

    /// 槽位指针
    #[inline]
    pub fn slot_ptr(&self, index: u16) -> *mut E {
        unsafe { self.base.as_ptr().add(self.wrap(index as usize) as usize) }
    }

    /// 写入槽位
    ///
    /// # 安全性
    /// 同一时刻不能有其他线程或设备访问这个槽位。
    #[inline]
    pub unsafe fn write(&self, index: u16, entry: E) {
        core::ptr::write_volatile(self.slot_ptr(index), entry);
    }

    /// 读取槽位
    ///
    /// # 安全性
    /// 同一时刻不能有其他线程或设备写入这个槽位。
    #[inline]
    pub unsafe fn read(&self, index: u16) -> E {
        core::ptr::read_volatile(self.slot_ptr(index))
    }
}

impl<E> Clone for RingSlots<E> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            base: self.base,
            offset: self.offset,
            capacity: self.capacity,
            io_addr: self.io_addr,
            _marker: PhantomData,
        }
    }
}

// 槽位访问本身是 unsafe 的，由调用者保证互斥
unsafe impl<E: RingEntry> Send for RingSlots<E> {}
unsafe impl<E: RingEntry> Sync for RingSlots<E> {}

/// 环形缓冲区
///
/// 记录生产者 (tail) 与消费者 (head) 指针。由主机产生条目的环
/// （提交队列）用 [`RingBuffer::produce`] / [`RingBuffer::consume`]，
/// 由设备产生条目的环（完成队列）只用 [`RingBuffer::advance_head`]，
/// 并用 phase 位判断槽位里是否是新条目。
pub struct RingBuffer<E> {
    slots: RingSlots<E>,
    /// 消费者指针
    head: u16,
    /// 生产者指针
    tail: u16,
    /// 已占用槽位数
    len: u32,
    /// 已占用槽位数的历史最大值
    peak: u32,
    /// 消费者期望的 phase，每绕回一圈翻转一次
    phase: bool,
}

impl<E: RingEntry> RingBuffer<E> {
    pub fn new(slots: RingSlots<E>) -> Self {
        Self {
            slots,
            head: 0,
            tail: 0,
            len: 0,
            peak: 0,
            phase: true,
        }
    }

    #[inline]
    pub fn slots(&self) -> &RingSlots<E> {
        &self.slots
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.slots.capacity
    }

    #[inline]
    pub fn head(&self) -> u16 {
        self.head
    }

    #[inline]
    pub fn tail(&self) -> u16 {
        self.tail
    }

    #[inline]
    pub fn phase(&self) -> bool {
        self.phase
    }

    /// 已占用槽位数
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity() as u32
    }

    /// 占用槽位数的历史最大值
    #[inline]
    pub fn peak(&self) -> usize {
        self.peak as usize
    }

    /// 预留 `n` 个连续槽位，返回第一个槽位的下标
    pub fn produce(&mut self, n: u16) -> Result<u16> {
        if self.len + n as u32 > self.capacity() as u32 {
            return Err(DriverError::QueueFull);
        }
        let first = self.tail;
        self.tail = self.slots.wrap(self.tail as usize + n as usize);
        self.len += n as u32;
        self.peak = self.peak.max(self.len);
        Ok(first)
    }

    /// 释放 `n` 个已被消费的槽位，返回释放前的 head
    pub fn consume(&mut self, n: u16) -> Result<u16> {
        if n as u32 > self.len {
            return Err(DriverError::InvalidArgument);
        }
        self.len -= n as u32;
        Ok(self.advance_head(n))
    }

    /// 移动 head，绕回时翻转 phase，返回移动前的 head
    pub fn advance_head(&mut self, n: u16) -> u16 {
        let first = self.head;
        let next = self.head as usize + n as usize;
        let laps = next / self.capacity() as usize;
        self.head = self.slots.wrap(next);
        if laps % 2 == 1 {
            self.phase = !self.phase;
        }
        first
    }
}

#[cfg(test)]
mod test {
    use alloc::sync::Arc;

    use super::{RingBuffer, RingEntry, RingSlots};
    use crate::dma::test::heap_region;
    use crate::dma::IoAddr;
    use crate::DriverError;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    #[repr(C)]
    struct Entry {
        value: u64,
        tag: u64,
    }

    unsafe impl RingEntry for Entry {}

    fn ring(capacity: u16) -> RingBuffer<Entry> {
        let region = Arc::new(heap_region(2 * 4096, 4096, 0x2000_0000));
        RingBuffer::new(RingSlots::new(region, 4096, capacity).unwrap())
    }

    #[test]
    fn capacity_must_be_power_of_two() {
        let region = Arc::new(heap_region(4096, 4096, 0));
        assert_eq!(
            RingSlots::<Entry>::new(region.clone(), 0, 48).err(),
            Some(DriverError::InvalidArgument)
        );
        assert_eq!(
            RingSlots::<Entry>::new(region.clone(), 0, 0).err(),
            Some(DriverError::InvalidArgument)
        );
        assert_eq!(
            RingSlots::<Entry>::new(region.clone(), 2048, 256).err(),
            Some(DriverError::BufferTooSmall)
        );
        assert!(RingSlots::<Entry>::new(region, 0, 256).is_ok());
    }

    #[test]
    fn ring_must_not_cross_an_io_page() {
        let region = Arc::new(heap_region(2 * 4096, 4096, 0));
        assert_eq!(
            RingSlots::<Entry>::new(region, 2048, 256).err(),
            Some(DriverError::InvalidArgument)
        );
    }

    #[test]
    fn io_addr_points_at_the_slots() {
        let ring = ring(64);
        assert_eq!(ring.slots().io_addr(), IoAddr::new(0x2010_0000));
        assert_eq!(ring.slots().offset(), 4096);
    }

    #[test]
    fn produce_wraps_and_tracks_occupancy() {
        let mut ring = ring(8);

        assert_eq!(ring.produce(6), Ok(0));
        assert_eq!(ring.consume(4), Ok(0));
        assert_eq!(ring.produce(6), Ok(6));
        assert_eq!(ring.tail(), 4);
        assert!(ring.is_full());
        assert_eq!(ring.produce(1), Err(DriverError::QueueFull));

        assert_eq!(ring.consume(8), Ok(4));
        assert!(ring.is_empty());
        assert_eq!(ring.head(), 4);
        assert_eq!(ring.peak(), 8);
        assert_eq!(ring.consume(1), Err(DriverError::InvalidArgument));
    }

    #[test]
    fn phase_flips_on_every_lap() {
        let mut ring = ring(4);
        assert!(ring.phase());

        ring.advance_head(3);
        assert!(ring.phase());
        ring.advance_head(1);
        assert!(!ring.phase());
        assert_eq!(ring.head(), 0);
        ring.advance_head(6);
        assert!(ring.phase());
        assert_eq!(ring.head(), 2);
    }

    #[test]
    fn slots_wrap_indices() {
        let ring = ring(4);
        let slots = ring.slots().clone();
        let entry = Entry { value: 7, tag: 9 };

        unsafe { slots.write(5, entry) };

        assert_eq!(slots.wrap(5), 1);
        assert_eq!(unsafe { slots.read(1) }, entry);
        assert_eq!(slots.slot_ptr(1), slots.slot_ptr(9));
    }
}

//! I/O 队列
//!
//! 设备以 `tail + 1 == head` 判定环满，因此一个深度为 `depth` 的队列
//! 最多同时容纳 `depth - 1` 个条目。

use core::sync::atomic::{AtomicU32, Ordering};

use libdriver::{Doorbell, DriverError, Result, RingBuffer, RingSlots};

use super::command::{CompletionEntry, SubmissionEntry};

/// NVMe 提交队列
pub struct SubmissionQueue {
    /// 队列 ID
    qid: u16,
    ring: RingBuffer<SubmissionEntry>,
    /// SQ tail 门铃
    doorbell: Doorbell,
}

impl SubmissionQueue {
    pub fn new(qid: u16, slots: RingSlots<SubmissionEntry>, doorbell: Doorbell) -> Self {
        Self {
            qid,
            ring: RingBuffer::new(slots),
            doorbell,
        }
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// 队列深度
    #[inline]
    pub fn depth(&self) -> u16 {
        self.ring.capacity()
    }

    /// 可同时在途的最大命令数
    #[inline]
    pub fn max_outstanding(&self) -> usize {
        self.depth() as usize - 1
    }

    /// 命令槽位，可被多个线程共享写入
    #[inline]
    pub fn slots(&self) -> &RingSlots<SubmissionEntry> {
        self.ring.slots()
    }

    #[inline]
    pub fn tail(&self) -> u16 {
        self.ring.tail()
    }

    #[inline]
    pub fn head(&self) -> u16 {
        self.ring.head()
    }

    /// 已提交但尚未完成的命令数
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.ring.len()
    }

    /// 在途命令数的历史最大值
    #[inline]
    pub fn peak(&self) -> usize {
        self.ring.peak()
    }

    /// 预留 `n` 个连续槽位，返回第一个槽位
    pub fn reserve(&mut self, n: u16) -> Result<u16> {
        if self.outstanding() + n as usize > self.max_outstanding() {
            return Err(DriverError::QueueFull);
        }
        self.ring.produce(n)
    }

    /// 写 SQ tail 门铃，之前写入的所有命令都对设备可见
    #[inline]
    pub fn ring_doorbell(&self) {
        self.doorbell.ring(self.ring.tail());
    }

    /// 消费一个完成条目后，head 前进一格
    #[inline]
    pub fn complete_one(&mut self) -> Result<u16> {
        self.ring.consume(1)
    }
}

/// NVMe 完成队列
pub struct CompletionQueue {
    /// 队列 ID
    qid: u16,
    ring: RingBuffer<CompletionEntry>,
    /// CQ head 门铃
    doorbell: Doorbell,
}

impl CompletionQueue {
    pub fn new(qid: u16, slots: RingSlots<CompletionEntry>, doorbell: Doorbell) -> Self {
        Self {
            qid,
            ring: RingBuffer::new(slots),
            doorbell,
        }
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.qid
    }

    #[inline]
    pub fn depth(&self) -> u16 {
        self.ring.capacity()
    }

    #[inline]
    pub fn head(&self) -> u16 {
        self.ring.head()
    }

    #[inline]
    pub fn phase(&self) -> bool {
        self.ring.phase()
    }

    #[inline]
    pub fn slots(&self) -> &RingSlots<CompletionEntry> {
        self.ring.slots()
    }

    /// 尝试获取下一个完成条目
    pub fn poll(&mut self) -> Option<CompletionEntry> {
        let slot = self.ring.slots().slot_ptr(self.ring.head());

        // 设备最后写入 DW3，Acquire 之后条目的其余部分也已可见
        let dw3 = unsafe { AtomicU32::from_ptr(&raw mut (*slot).cid_status) }.load(Ordering::Acquire);
        if (dw3 >> 16) & 1 != self.ring.phase() as u32 {
            return None;
        }

        let mut entry = unsafe { self.ring.slots().read(self.ring.head()) };
        entry.cid_status = dw3;
        self.ring.advance_head(1);
        Some(entry)
    }

    /// 写 CQ head 门铃，把已消费的槽位还给设备
    #[inline]
    pub fn ring_doorbell(&self) {
        self.doorbell.ring(self.ring.head());
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicU32, Ordering};

    use libdriver::{DriverError, RingSlots};

    use crate::nvme::command::{status, CompletionEntry, SubmissionEntry};
    use crate::tests::{heap_region, register_file};

    use super::{CompletionQueue, SubmissionQueue};

    #[test]
    fn reserve_leaves_one_slot_free() {
        let region = heap_region(4096);
        let (_regs, mmio) = register_file();
        let slots = RingSlots::<SubmissionEntry>::new(region, 0, 8).unwrap();
        let mut sq = SubmissionQueue::new(1, slots, mmio.doorbell(0).unwrap());

        assert_eq!(sq.reserve(4), Ok(0));
        assert_eq!(sq.reserve(4), Err(DriverError::QueueFull));
        assert_eq!(sq.reserve(3), Ok(4));
        assert_eq!(sq.outstanding(), 7);

        sq.ring_doorbell();
        assert_eq!(mmio.read_u32(0), Ok(7));

        for _ in 0..7 {
            sq.complete_one().unwrap();
        }
        assert_eq!(sq.head(), 7);
        assert_eq!(sq.peak(), 7);
        assert_eq!(sq.complete_one(), Err(DriverError::InvalidArgument));
    }

    #[test]
    fn poll_follows_phase_tag() {
        let region = heap_region(4096);
        let (_regs, mmio) = register_file();
        let slots = RingSlots::<CompletionEntry>::new(region, 0, 2).unwrap();
        let device = slots.clone();
        let mut cq = CompletionQueue::new(1, slots, mmio.doorbell(4).unwrap());

        assert_eq!(cq.poll(), None);

        let post = |index: u16, entry: CompletionEntry| {
            let slot = device.slot_ptr(index);
            unsafe {
                AtomicU32::from_ptr(&raw mut (*slot).cid_status).store(entry.cid_status, Ordering::Release);
            }
        };

        post(0, CompletionEntry::new(1, 1, 10, true, status::SUCCESS));
        post(1, CompletionEntry::new(2, 1, 11, true, status::UNRECOVERED_READ_ERROR));

        assert_eq!(cq.poll().map(|e| e.cid()), Some(10));
        let failed = cq.poll().unwrap();
        assert!(!failed.is_success());
        assert_eq!(cq.head(), 0);
        assert!(!cq.phase());

        // 旧条目的 phase 是 1，绕回之后不再被当成新条目
        assert_eq!(cq.poll(), None);

        post(0, CompletionEntry::new(3, 1, 12, false, status::SUCCESS));
        assert_eq!(cq.poll().map(|e| e.cid()), Some(12));

        cq.ring_doorbell();
        assert_eq!(mmio.read_u32(4), Ok(1));
    }
}

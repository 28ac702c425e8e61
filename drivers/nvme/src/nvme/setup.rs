//! 队列对建立
//!
//! 在一块两页的 DMA 区域上建立一对 I/O 队列：第 0 页放完成队列，
//! 第 1 页放提交队列。先创建 CQ，再创建绑定到它的 SQ，随后把两个
//! 门铃转换成计算核心可以直接写入的地址。任何一步失败都会删除已经
//! 创建的队列，不会返回半成品。

use std::sync::Arc;

use libdriver::{DmaRegion, DriverError, QueueKind, Result, RingSlots};
use log::{debug, error, warn};

use super::command::{
    COMPLETION_ENTRY_SIZE, CompletionEntry, QueueFlags, SUBMISSION_ENTRY_SIZE, SubmissionEntry,
};
use super::controller::{Controller, DoorbellMapper};
use super::queue::{CompletionQueue, SubmissionQueue};

/// 一页内能放下的队列深度
///
/// 不超过控制器的 MQES，向下取整到 2 的幂。
pub fn queue_depth(page_size: usize, entry_size: usize, max_queue_entries: u32) -> u16 {
    let entries = (page_size / entry_size)
        .min(max_queue_entries as usize)
        .min(1 << 15);
    if entries < 2 {
        return 0;
    }
    (1usize << entries.ilog2()) as u16
}

/// 创建 I/O 完成队列并映射它的 head 门铃
pub fn create_completion_queue(
    ctrl: &dyn Controller,
    mapper: &dyn DoorbellMapper,
    qid: u16,
    slots: RingSlots<CompletionEntry>,
) -> Result<CompletionQueue> {
    let info = ctrl.info();
    let depth = slots.capacity();

    let entry = SubmissionEntry::create_io_cq(
        0,
        qid,
        slots.io_addr().as_u64(),
        depth,
        QueueFlags::PHYSICALLY_CONTIGUOUS,
    );
    let completion = ctrl.execute_admin(entry)?;
    if !completion.is_success() {
        error!(
            "nvme: create completion queue {} failed, status {:#x}",
            qid,
            completion.status()
        );
        return Err(DriverError::QueueCreation {
            qid,
            kind: QueueKind::Completion,
            status: completion.status(),
        });
    }

    let doorbell = match mapper.map_doorbell(info.cq_doorbell(qid)) {
        Ok(doorbell) => doorbell,
        Err(err) => {
            error!("nvme: failed to map completion queue {} doorbell: {}", qid, err);
            rollback(ctrl, qid, QueueKind::Completion);
            return Err(err);
        }
    };

    debug!(
        "nvme: created completion queue {} at {} with {} entries, doorbell {}",
        qid,
        slots.io_addr(),
        depth,
        doorbell.host_addr()
    );
    Ok(CompletionQueue::new(qid, slots, doorbell))
}

/// 创建绑定到 `cq` 的 I/O 提交队列并映射它的 tail 门铃
pub fn create_submission_queue(
    ctrl: &dyn Controller,
    mapper: &dyn DoorbellMapper,
    cq: &CompletionQueue,
    qid: u16,
    slots: RingSlots<SubmissionEntry>,
) -> Result<SubmissionQueue> {
    let info = ctrl.info();
    let depth = slots.capacity();

    let entry = SubmissionEntry::create_io_sq(
        0,
        qid,
        slots.io_addr().as_u64(),
        depth,
        cq.qid(),
        QueueFlags::PHYSICALLY_CONTIGUOUS,
    );
    let completion = ctrl.execute_admin(entry)?;
    if !completion.is_success() {
        error!(
            "nvme: create submission queue {} failed, status {:#x}",
            qid,
            completion.status()
        );
        return Err(DriverError::QueueCreation {
            qid,
            kind: QueueKind::Submission,
            status: completion.status(),
        });
    }

    let doorbell = match mapper.map_doorbell(info.sq_doorbell(qid)) {
        Ok(doorbell) => doorbell,
        Err(err) => {
            error!("nvme: failed to map submission queue {} doorbell: {}", qid, err);
            rollback(ctrl, qid, QueueKind::Submission);
            return Err(err);
        }
    };

    debug!(
        "nvme: created submission queue {} at {} with {} entries bound to completion queue {}, doorbell {}",
        qid,
        slots.io_addr(),
        depth,
        cq.qid(),
        doorbell.host_addr()
    );
    Ok(SubmissionQueue::new(qid, slots, doorbell))
}

/// 删除 I/O 队列
pub fn delete_queue(ctrl: &dyn Controller, qid: u16, kind: QueueKind) -> Result<()> {
    let entry = match kind {
        QueueKind::Submission => SubmissionEntry::delete_io_sq(0, qid),
        QueueKind::Completion => SubmissionEntry::delete_io_cq(0, qid),
    };

    let completion = ctrl.execute_admin(entry)?;
    if !completion.is_success() {
        warn!(
            "nvme: delete {} {} failed, status {:#x}",
            kind,
            qid,
            completion.status()
        );
        return Err(DriverError::QueueDeletion {
            qid,
            kind,
            status: completion.status(),
        });
    }

    debug!("nvme: deleted {} {}", kind, qid);
    Ok(())
}

/// 删除建立到一半的队列，失败只记录
fn rollback(ctrl: &dyn Controller, qid: u16, kind: QueueKind) {
    if let Err(err) = delete_queue(ctrl, qid, kind) {
        warn!("nvme: failed to roll back {} {}: {}", kind, qid, err);
    }
}

/// NVMe 队列对
///
/// 建立之后页大小、块大小和 namespace 不再改变；
/// 读内核只修改两个队列的环指针。
pub struct QueuePair {
    /// 队列 ID
    qid: u16,
    /// 每个逻辑页的字节数
    page_size: usize,
    /// 设备逻辑块大小
    block_size: usize,
    /// 每个逻辑页的块数
    blocks_per_page: u32,
    /// Namespace ID
    nsid: u32,
    /// 提交队列
    sq: SubmissionQueue,
    /// 完成队列
    cq: CompletionQueue,
}

impl QueuePair {
    /// 在 `region` 上建立队列对
    ///
    /// `region` 至少两个控制器页大小；内容会被清零。
    pub fn create(
        ctrl: &dyn Controller,
        mapper: &dyn DoorbellMapper,
        mut region: DmaRegion,
        qid: u16,
        nsid: u32,
    ) -> Result<Self> {
        let info = ctrl.info();
        let namespace = ctrl.namespace(nsid)?;

        let page_size = info.page_size;
        let block_size = namespace.block_size as usize;
        if qid == 0 {
            error!("nvme: queue id {} cannot be used for I/O", qid);
            return Err(DriverError::InvalidArgument);
        }
        if block_size == 0 || page_size % block_size != 0 {
            error!(
                "nvme: page size {} is not a multiple of block size {}",
                page_size, block_size
            );
            return Err(DriverError::InvalidArgument);
        }
        let blocks_per_page = page_size / block_size;
        if blocks_per_page > 1 << 16 {
            error!("nvme: {} blocks per page exceed one read command", blocks_per_page);
            return Err(DriverError::NotSupported);
        }
        if region.size() < 2 * page_size {
            error!(
                "nvme: queue memory of {} bytes cannot hold two {} byte pages",
                region.size(),
                page_size
            );
            return Err(DriverError::BufferTooSmall);
        }

        let cq_depth = queue_depth(page_size, COMPLETION_ENTRY_SIZE, info.max_queue_entries);
        let sq_depth = queue_depth(page_size, SUBMISSION_ENTRY_SIZE, info.max_queue_entries);
        if cq_depth < 2 || sq_depth < 2 {
            error!("nvme: page size {} is too small for I/O queues", page_size);
            return Err(DriverError::InvalidArgument);
        }

        region.zero();
        let region = Arc::new(region);
        let cq_slots = RingSlots::<CompletionEntry>::new(region.clone(), 0, cq_depth)?;
        let sq_slots = RingSlots::<SubmissionEntry>::new(region, page_size, sq_depth)?;

        let cq = create_completion_queue(ctrl, mapper, qid, cq_slots)?;
        let sq = match create_submission_queue(ctrl, mapper, &cq, qid, sq_slots) {
            Ok(sq) => sq,
            Err(err) => {
                rollback(ctrl, qid, QueueKind::Completion);
                return Err(err);
            }
        };

        debug!(
            "nvme: queue pair {} ready: page size {}, block size {}, namespace {}",
            qid, page_size, block_size, nsid
        );

        Ok(Self {
            qid,
            page_size,
            block_size,
            blocks_per_page: blocks_per_page as u32,
            nsid,
            sq,
            cq,
        })
    }

    /// 删除 SQ 与 CQ
    ///
    /// 两条删除命令都会尝试，返回第一个错误。
    pub fn destroy(self, ctrl: &dyn Controller) -> Result<()> {
        let sq = delete_queue(ctrl, self.qid, QueueKind::Submission);
        let cq = delete_queue(ctrl, self.qid, QueueKind::Completion);
        sq.and(cq)
    }

    #[inline]
    pub fn qid(&self) -> u16 {
        self.qid
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn blocks_per_page(&self) -> u32 {
        self.blocks_per_page
    }

    #[inline]
    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    #[inline]
    pub fn submission_queue(&self) -> &SubmissionQueue {
        &self.sq
    }

    #[inline]
    pub fn completion_queue(&self) -> &CompletionQueue {
        &self.cq
    }

    /// 同时借出两个队列
    #[inline]
    pub fn queues_mut(&mut self) -> (&mut SubmissionQueue, &mut CompletionQueue) {
        (&mut self.sq, &mut self.cq)
    }
}

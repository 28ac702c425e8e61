//! 读内核
//!
//! 一组固定数量的线程共同驱动一个队列对：线程 `t` 负责逻辑页
//! `t, t + n, t + 2n, ...`。每一轮 (window) 每个线程向提交队列写入一条
//! 读命令，线程 0 统一敲门铃、收完成条目；数据由设备写进源区域的两个
//! 半区之一，再由各线程拷贝到目标缓冲区。
//!
//! 每一轮的顺序固定为
//!
//! ```text
//! build(w + 1) -> barrier -> drain(w), submit(w + 1) -> barrier -> copy(w)
//! ```
//!
//! 设备执行第 `w + 1` 批时，各线程在另一半区拷贝第 `w` 批。第 `w + 2`
//! 批要等到所有线程拷贝完第 `w` 批、越过下一轮的第一个 barrier 之后才会
//! 提交，因此设备不会覆盖正在被拷贝的半区。提交队列里最多同时有两批
//! 命令。
//!
//! 环指针、门铃和错误计数只由线程 0 修改；其余线程只写自己的命令槽位
//! 和自己的目标页。

use std::sync::atomic::{Ordering, fence};
use std::thread;

use libdriver::{DmaRegion, DriverError, IoAddr, Result, RingSlots};
use log::{debug, error, trace, warn};
use spin::barrier::Barrier;
use spin::relax::{RelaxStrategy, Yield};

use crate::nvme::command::SubmissionEntry;
use crate::nvme::queue::{CompletionQueue, SubmissionQueue};
use crate::nvme::setup::QueuePair;

/// 一次内核运行的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// 敲门铃提交的批数
    pub batches: u64,
    /// 发出的读命令数
    pub commands: u64,
    /// 消费的完成条目数
    pub completions: u64,
    /// 提交队列在途命令数的最大值
    pub peak_outstanding: usize,
}

/// 负责第 `page` 页的线程
#[inline]
pub fn owner(page: usize, num_threads: usize) -> usize {
    page % num_threads
}

/// 启动参数
#[derive(Debug, Clone, Copy)]
struct Launch {
    num_threads: usize,
    num_pages: usize,
    page_size: usize,
    blocks_per_page: u32,
    nsid: u32,
    start_block: u64,
    /// 第 0 轮第 0 个线程的命令序号
    first_slot: usize,
}

impl Launch {
    #[inline]
    fn windows(&self) -> usize {
        self.num_pages.div_ceil(self.num_threads)
    }

    /// 第 `window` 轮的命令数，最后一轮可能不满
    #[inline]
    fn batch_len(&self, window: usize) -> usize {
        (self.num_pages - window * self.num_threads).min(self.num_threads)
    }

    #[inline]
    fn page(&self, window: usize, thread: usize) -> Option<usize> {
        let page = window * self.num_threads + thread;
        (page < self.num_pages).then_some(page)
    }

    /// 源区域中的位置：偶数轮用前半区，奇数轮用后半区
    #[inline]
    fn source_offset(&self, half: usize, thread: usize) -> usize {
        (half * self.num_threads + thread) * self.page_size
    }

    #[inline]
    fn sequence(&self, window: usize, thread: usize) -> usize {
        self.first_slot + window * self.num_threads + thread
    }
}

struct Cohort<'a> {
    launch: Launch,
    barrier: Barrier<Yield>,
    slots: RingSlots<SubmissionEntry>,
    source: &'a DmaRegion,
    /// 每个线程在两个半区中的 I/O 地址
    targets: Vec<[IoAddr; 2]>,
}

impl Cohort<'_> {
    /// 为第 `window` 轮写入本线程的读命令
    fn build(&self, thread: usize, window: usize) {
        let Some(page) = self.launch.page(window, thread) else {
            return;
        };

        let slot = self.slots.wrap(self.launch.sequence(window, thread));
        let lba = self.launch.start_block + page as u64 * self.launch.blocks_per_page as u64;
        let target = self.targets[thread][window % 2];
        let command = SubmissionEntry::read(
            slot,
            self.launch.nsid,
            lba,
            self.launch.blocks_per_page,
            target.as_u64(),
            0,
        );

        // 每个线程每轮只写自己的槽位；该槽位上一次的命令已经完成
        unsafe { self.slots.write(slot, command) };
    }

    /// 把第 `window` 轮已完成的页拷贝到目标位置
    fn copy(&self, thread: usize, window: usize, lane: &mut [&mut [u8]]) {
        if self.launch.page(window, thread).is_none() {
            return;
        }

        let offset = self.launch.source_offset(window % 2, thread);
        self.source
            .read(offset, &mut *lane[window])
            .unwrap_or_else(|_| unreachable!("source halves are checked before launch"));
    }

    fn run(&self, thread: usize, mut lane: Vec<&mut [u8]>, mut coordinator: Option<&mut Coordinator<'_>>) {
        let windows = self.launch.windows();

        self.build(thread, 0);
        if let Some(c) = coordinator.as_deref_mut() {
            c.reset_errors();
            c.reserve(self.launch.batch_len(0));
        }
        fence(Ordering::SeqCst);
        self.barrier.wait();
        if let Some(c) = coordinator.as_deref_mut() {
            c.submit();
        }
        self.barrier.wait();

        for window in 0..windows - 1 {
            self.build(thread, window + 1);
            if let Some(c) = coordinator.as_deref_mut() {
                c.reserve(self.launch.batch_len(window + 1));
            }
            fence(Ordering::SeqCst);
            self.barrier.wait();

            if let Some(c) = coordinator.as_deref_mut() {
                c.drain(self.launch.batch_len(window));
                c.submit();
            }
            self.barrier.wait();

            self.copy(thread, window, &mut lane);
        }

        if let Some(c) = coordinator.as_deref_mut() {
            c.drain(self.launch.batch_len(windows - 1));
        }
        self.barrier.wait();
        self.copy(thread, windows - 1, &mut lane);
    }
}

/// 线程 0 持有的环状态
struct Coordinator<'a> {
    sq: &'a mut SubmissionQueue,
    cq: &'a mut CompletionQueue,
    errors: &'a mut u64,
    stats: KernelStats,
}

impl Coordinator<'_> {
    fn reset_errors(&mut self) {
        *self.errors = 0;
    }

    fn reserve(&mut self, batch_len: usize) {
        self.sq
            .reserve(batch_len as u16)
            .unwrap_or_else(|_| unreachable!("ring occupancy is checked before launch"));
        self.stats.commands += batch_len as u64;
        self.stats.peak_outstanding = self.stats.peak_outstanding.max(self.sq.outstanding());
    }

    fn submit(&mut self) {
        self.sq.ring_doorbell();
        self.stats.batches += 1;
        trace!(
            "kernel: batch {} submitted, sq tail {}, {} outstanding",
            self.stats.batches,
            self.sq.tail(),
            self.sq.outstanding()
        );
    }

    /// 等待 `expected` 个完成条目，然后写 CQ head 门铃
    fn drain(&mut self, expected: usize) {
        for _ in 0..expected {
            let entry = loop {
                if let Some(entry) = self.cq.poll() {
                    break entry;
                }
                Yield::relax();
            };

            self.sq
                .complete_one()
                .unwrap_or_else(|_| unreachable!("completion without an outstanding command"));

            if !entry.is_success() {
                *self.errors += 1;
                warn!(
                    "kernel: command {} failed, sct {:#x} sc {:#x}",
                    entry.cid(),
                    entry.status_type(),
                    entry.status_code()
                );
            }
        }

        self.cq.ring_doorbell();
        self.stats.completions += expected as u64;
        trace!(
            "kernel: drained {} completions, cq head {}",
            expected,
            self.cq.head()
        );
    }
}

/// 读取 `num_pages` 个逻辑页到 `destination`
///
/// 逻辑页 `p` 位于 `start_block + p * blocks_per_page`，被拷贝到
/// `destination[p * page_size..]`。`source` 至少容纳 `2 * num_threads` 页，
/// 设备把数据写到这里。`errors` 在第一批提交前清零，运行结束时等于
/// 状态不为成功的完成条目数。
///
/// 设备不响应时该函数不会返回。
pub fn read_pages(
    qp: &mut QueuePair,
    source: &DmaRegion,
    destination: &mut [u8],
    num_pages: usize,
    num_threads: usize,
    start_block: u64,
    errors: &mut u64,
) -> Result<KernelStats> {
    let targets = validate(qp, source, destination.len(), num_pages, num_threads, start_block)?;

    let page_size = qp.page_size();
    let launch = Launch {
        num_threads,
        num_pages,
        page_size,
        blocks_per_page: qp.blocks_per_page(),
        nsid: qp.nsid(),
        start_block,
        first_slot: qp.submission_queue().tail() as usize,
    };
    let (sq, cq) = qp.queues_mut();

    debug!(
        "kernel: reading {} pages of {} bytes from block {} with {} threads, {} windows",
        num_pages,
        page_size,
        start_block,
        num_threads,
        launch.windows()
    );

    let cohort = Cohort {
        launch,
        barrier: Barrier::new(num_threads),
        slots: sq.slots().clone(),
        source,
        targets,
    };

    // 按 owner(page) 把目标缓冲区切成互不重叠的页
    let mut lanes: Vec<Vec<&mut [u8]>> = (0..num_threads)
        .map(|_| Vec::with_capacity(launch.windows()))
        .collect();
    for (page, chunk) in destination[..num_pages * page_size]
        .chunks_mut(page_size)
        .enumerate()
    {
        lanes[owner(page, num_threads)].push(chunk);
    }

    let mut coordinator = Coordinator {
        sq,
        cq,
        errors,
        stats: KernelStats::default(),
    };

    thread::scope(|scope| {
        let mut lanes = lanes.into_iter();
        let first = lanes.next().unwrap_or_default();
        let cohort = &cohort;

        for (index, lane) in lanes.enumerate() {
            scope.spawn(move || cohort.run(index + 1, lane, None));
        }
        cohort.run(0, first, Some(&mut coordinator));
    });

    let stats = coordinator.stats;
    debug!(
        "kernel: done, {} batches, {} completions, {} failed, peak {} outstanding",
        stats.batches, stats.completions, coordinator.errors, stats.peak_outstanding
    );
    Ok(stats)
}

/// 检查启动参数，返回每个线程在两个半区中的 I/O 地址
fn validate(
    qp: &QueuePair,
    source: &DmaRegion,
    destination_len: usize,
    num_pages: usize,
    num_threads: usize,
    start_block: u64,
) -> Result<Vec<[IoAddr; 2]>> {
    let page_size = qp.page_size();
    let sq = qp.submission_queue();
    let cq = qp.completion_queue();

    if num_threads == 0 || num_pages == 0 {
        error!(
            "kernel: cannot launch {} threads for {} pages",
            num_threads, num_pages
        );
        return Err(DriverError::InvalidArgument);
    }
    if num_threads > sq.max_outstanding() / 2 {
        error!(
            "kernel: {} threads need two windows of submission slots, queue {} holds {}",
            num_threads,
            sq.qid(),
            sq.max_outstanding()
        );
        return Err(DriverError::InvalidArgument);
    }
    if num_threads >= cq.depth() as usize {
        error!(
            "kernel: {} completions per batch overflow completion queue {} of depth {}",
            num_threads,
            cq.qid(),
            cq.depth()
        );
        return Err(DriverError::InvalidArgument);
    }
    if sq.outstanding() != 0 {
        error!("kernel: submission queue {} is not idle", sq.qid());
        return Err(DriverError::InvalidArgument);
    }

    let bytes = num_pages
        .checked_mul(page_size)
        .ok_or(DriverError::InvalidArgument)?;
    if destination_len < bytes {
        error!(
            "kernel: destination of {} bytes cannot hold {} pages",
            destination_len, num_pages
        );
        return Err(DriverError::BufferTooSmall);
    }
    if source.size() < 2 * num_threads * page_size {
        error!(
            "kernel: source of {} bytes cannot hold two windows of {} pages",
            source.size(),
            num_threads
        );
        return Err(DriverError::BufferTooSmall);
    }

    let blocks = (num_pages as u64).checked_mul(qp.blocks_per_page() as u64);
    if blocks.and_then(|blocks| start_block.checked_add(blocks)).is_none() {
        error!("kernel: block range starting at {} overflows", start_block);
        return Err(DriverError::InvalidArgument);
    }

    (0..num_threads)
        .map(|thread| -> Result<[IoAddr; 2]> {
            let mut target = [IoAddr::NULL; 2];
            for (half, addr) in target.iter_mut().enumerate() {
                let offset = (half * num_threads + thread) * page_size;
                if !source.within_page(offset, page_size) {
                    error!("kernel: source page at offset {:#x} crosses an I/O page", offset);
                    return Err(DriverError::InvalidArgument);
                }
                *addr = source
                    .io_addr_at(offset)
                    .ok_or(DriverError::InvalidArgument)?;
            }
            Ok(target)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use libdriver::DriverError;

    use crate::emu::EmulatorConfig;
    use crate::tests::{Fixture, expected_page};

    use super::{owner, read_pages};

    fn assert_pages(fixture: &Fixture, destination: &[u8], start_block: u64, skip: &[usize]) {
        let page_size = fixture.config.page_size;
        for (page, chunk) in destination.chunks(page_size).enumerate() {
            if skip.contains(&page) {
                continue;
            }
            assert!(
                chunk == expected_page(fixture, start_block, page).as_slice(),
                "page {page} differs"
            );
        }
    }

    #[test]
    fn owner_is_strided() {
        assert_eq!(owner(0, 4), 0);
        assert_eq!(owner(5, 4), 1);
        assert_eq!(owner(7, 4), 3);
        assert_eq!(owner(8, 4), 0);
    }

    #[test]
    fn four_threads_eight_pages() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let mut qp = fixture.queue_pair(1);
        let source = fixture.source(4);
        let mut destination = vec![0u8; 8 * fixture.config.page_size];
        let mut errors = u64::MAX;

        let stats = read_pages(&mut qp, &source, &mut destination, 8, 4, 0, &mut errors).unwrap();

        assert_eq!(errors, 0);
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.commands, 8);
        assert_eq!(stats.completions, 8);
        assert_pages(&fixture, &destination, 0, &[]);
        assert_eq!(fixture.controller.stats().commands, 8);
    }

    #[test]
    fn round_trip_for_many_cohort_sizes() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let mut qp = fixture.queue_pair(1);

        for num_threads in [1, 2, 3, 8, 16] {
            let num_pages = 5 * num_threads;
            let source = fixture.source(num_threads);
            let mut destination = vec![0u8; num_pages * fixture.config.page_size];
            let mut errors = 0;

            read_pages(&mut qp, &source, &mut destination, num_pages, num_threads, 0, &mut errors)
                .unwrap();

            assert_eq!(errors, 0, "{num_threads} threads");
            assert_pages(&fixture, &destination, 0, &[]);
        }
    }

    #[test]
    fn injected_failure_is_counted_once() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let blocks_per_page = fixture.blocks_per_page();
        fixture.controller.inject_read_fault(5 * blocks_per_page + 1);

        let mut qp = fixture.queue_pair(1);
        let source = fixture.source(4);
        let mut destination = vec![0u8; 8 * fixture.config.page_size];
        let mut errors = 0;

        read_pages(&mut qp, &source, &mut destination, 8, 4, 0, &mut errors).unwrap();

        assert_eq!(errors, 1);
        assert_pages(&fixture, &destination, 0, &[5]);
    }

    #[test]
    fn error_count_does_not_depend_on_cohort_size() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let blocks_per_page = fixture.blocks_per_page();
        for page in [0, 3, 31, 32, 63, 64, 100, 127] {
            fixture.controller.inject_read_fault(page * blocks_per_page);
        }

        let mut counts = Vec::new();
        for (qid, num_threads) in [(1, 32), (2, 64)] {
            let mut qp = fixture.queue_pair(qid);
            let source = fixture.source(num_threads);
            let mut destination = vec![0u8; 128 * fixture.config.page_size];
            let mut errors = 0;

            read_pages(&mut qp, &source, &mut destination, 128, num_threads, 0, &mut errors).unwrap();
            assert_pages(&fixture, &destination, 0, &[0, 3, 31, 32, 63, 64, 100, 127]);

            counts.push(errors);
            qp.destroy(&fixture.controller).unwrap();
        }

        assert_eq!(counts, [8, 8]);
    }

    #[test]
    fn occupancy_stays_within_two_batches() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let mut qp = fixture.queue_pair(1);
        let source = fixture.source(8);
        let mut destination = vec![0u8; 64 * fixture.config.page_size];
        let mut errors = 0;

        let stats = read_pages(&mut qp, &source, &mut destination, 64, 8, 0, &mut errors).unwrap();

        assert!(stats.peak_outstanding <= 16);
        assert!(qp.submission_queue().peak() <= 16);
        assert!(fixture.controller.stats().max_outstanding <= 16);
        assert_eq!(qp.submission_queue().outstanding(), 0);
    }

    #[test]
    fn partial_last_window() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let page_size = fixture.config.page_size;
        let mut qp = fixture.queue_pair(1);
        let source = fixture.source(4);

        // 末尾多出一页哨兵，不能被写到
        let mut destination = vec![0xA5u8; 11 * page_size];
        let mut errors = 0;

        let stats = read_pages(&mut qp, &source, &mut destination, 10, 4, 0, &mut errors).unwrap();

        assert_eq!(errors, 0);
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.commands, 10);
        assert_eq!(stats.completions, 10);
        assert_pages(&fixture, &destination[..10 * page_size], 0, &[]);
        assert!(destination[10 * page_size..].iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn fewer_pages_than_threads() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let mut qp = fixture.queue_pair(1);
        let source = fixture.source(8);
        let mut destination = vec![0u8; 3 * fixture.config.page_size];
        let mut errors = 0;

        let stats = read_pages(&mut qp, &source, &mut destination, 3, 8, 0, &mut errors).unwrap();

        assert_eq!(stats.batches, 1);
        assert_eq!(stats.commands, 3);
        assert_pages(&fixture, &destination, 0, &[]);
    }

    #[test]
    fn start_block_offsets_every_page() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let start_block = 3 * fixture.blocks_per_page() + 2;
        let mut qp = fixture.queue_pair(1);
        let source = fixture.source(2);
        let mut destination = vec![0u8; 6 * fixture.config.page_size];
        let mut errors = 0;

        read_pages(&mut qp, &source, &mut destination, 6, 2, start_block, &mut errors).unwrap();

        assert_eq!(errors, 0);
        assert_pages(&fixture, &destination, start_block, &[]);
    }

    #[test]
    fn ring_wraps_across_runs() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let mut qp = fixture.queue_pair(1);
        let depth = qp.completion_queue().depth() as usize;
        let source = fixture.source(7);

        // 每次 35 条命令，CQ 比 SQ 深，按 CQ 绕回两圈计
        for _ in 0..(2 * depth).div_ceil(35) {
            let mut destination = vec![0u8; 35 * fixture.config.page_size];
            let mut errors = 0;
            read_pages(&mut qp, &source, &mut destination, 35, 7, 0, &mut errors).unwrap();
            assert_eq!(errors, 0);
            assert_pages(&fixture, &destination, 0, &[]);
        }
    }

    #[test]
    fn launch_arguments_are_checked() {
        let fixture = Fixture::new(EmulatorConfig::small());
        let page_size = fixture.config.page_size;
        let mut qp = fixture.queue_pair(1);
        let max_threads = qp.submission_queue().max_outstanding() / 2;
        let source = fixture.source(4);
        let mut destination = vec![0u8; 8 * page_size];
        let mut errors = 0;

        let mut launch = |pages: usize, threads: usize| {
            read_pages(&mut qp, &source, &mut destination, pages, threads, 0, &mut errors).err()
        };

        assert_eq!(launch(8, 0), Some(DriverError::InvalidArgument));
        assert_eq!(launch(0, 4), Some(DriverError::InvalidArgument));
        assert_eq!(launch(8, max_threads + 1), Some(DriverError::InvalidArgument));
        assert_eq!(launch(1, usize::MAX / 2 + 1), Some(DriverError::InvalidArgument));
        assert_eq!(launch(1, usize::MAX), Some(DriverError::InvalidArgument));
        assert_eq!(launch(9, 4), Some(DriverError::BufferTooSmall));
        assert_eq!(launch(8, 8), Some(DriverError::BufferTooSmall));
        assert_eq!(fixture.controller.stats().commands, 0);
    }
}

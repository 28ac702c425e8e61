//! 读吞吐基准
//!
//! 分配队列内存、源区域和目标缓冲区，建立队列对，运行一次读内核并计时，
//! 最后删除队列对。目标缓冲区可以原样写入文件以便检查。

use std::path::PathBuf;
use std::time::{Duration, Instant};

use libdriver::dma::page_align;
use libdriver::{DMA_ALIGNMENT, DmaOptions, DmaProvider, DmaRegion, DriverError, Result, Topology};
use log::{debug, error, info};

use crate::kernel::{KernelStats, read_pages};
use crate::nvme::controller::{Controller, DoorbellMapper};
use crate::nvme::setup::QueuePair;

/// 基准参数
#[derive(Debug, Clone)]
pub struct BenchSettings {
    /// 线程数
    pub num_threads: usize,
    /// 总页数
    pub num_pages: usize,
    pub namespace_id: u32,
    /// 第 0 页所在的块
    pub start_block: u64,
    /// I/O 队列 ID
    pub queue_id: u16,
    /// 传给 DMA 提供者的设备 ID
    pub device_id: u32,
    pub topology: Option<Topology>,
    /// 目标缓冲区的输出文件
    pub output: Option<PathBuf>,
}

impl BenchSettings {
    /// 页数溢出时取 `usize::MAX`，由启动检查拒绝
    pub fn new(num_threads: usize, pages_per_thread: usize) -> Self {
        Self {
            num_threads,
            num_pages: num_threads.saturating_mul(pages_per_thread),
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace_id: u32) -> Self {
        self.namespace_id = namespace_id;
        self
    }

    pub fn with_start_block(mut self, start_block: u64) -> Self {
        self.start_block = start_block;
        self
    }

    pub fn with_queue_id(mut self, queue_id: u16) -> Self {
        self.queue_id = queue_id;
        self
    }

    pub fn with_device(mut self, device_id: u32, topology: Option<Topology>) -> Self {
        self.device_id = device_id;
        self.topology = topology;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            num_threads: 32,
            num_pages: 32 * 16,
            namespace_id: 1,
            start_block: 0,
            queue_id: 1,
            device_id: 0,
            topology: None,
            output: None,
        }
    }
}

/// 基准结果
#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    /// MiB/s
    pub throughput_mibps: f64,
    /// 状态不为成功的完成条目数
    pub error_count: u64,
    /// 内核运行时间
    pub elapsed: Duration,
    /// 读取的字节数
    pub bytes: usize,
    pub stats: KernelStats,
    /// 目标缓冲区
    pub destination: Vec<u8>,
}

/// 每秒 MiB 数
pub fn throughput_mibps(bytes: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / (1024.0 * 1024.0) / secs
}

fn allocate(
    dma: &dyn DmaProvider,
    size: usize,
    settings: &BenchSettings,
    options: DmaOptions,
) -> Result<DmaRegion> {
    dma.allocate(size, settings.device_id, settings.topology.as_ref(), options)
        .map_err(|err| {
            error!("bench: failed to allocate {} bytes of dma memory: {}", size, err);
            DriverError::DmaAllocation { size }
        })
}

/// 运行一次读基准
///
/// 设备报告的读错误只计数；建立队列对、分配内存或写输出文件失败时返回错误。
/// 队列对在返回前总是被删除。
pub fn run_benchmark(
    ctrl: &dyn Controller,
    mapper: &dyn DoorbellMapper,
    dma: &dyn DmaProvider,
    settings: &BenchSettings,
) -> Result<BenchmarkResult> {
    let page_size = ctrl.info().page_size;

    let queue_memory = allocate(
        dma,
        2 * page_size,
        settings,
        DmaOptions::ZERO | DmaOptions::CONTIGUOUS,
    )?;
    let mut qp = QueuePair::create(
        ctrl,
        mapper,
        queue_memory,
        settings.queue_id,
        settings.namespace_id,
    )?;

    let result = run_on(&mut qp, dma, settings);
    let teardown = qp.destroy(ctrl);
    let result = result?;
    teardown?;

    if let Some(path) = &settings.output {
        std::fs::write(path, &result.destination).map_err(|err| {
            error!("bench: failed to write {}: {}", path.display(), err);
            err.raw_os_error()
                .map_or(DriverError::IoError, DriverError::SystemError)
        })?;
        debug!("bench: wrote {} bytes to {}", result.bytes, path.display());
    }

    info!(
        "bench: {} pages with {} threads, {} bytes in {:?}, {:.2} MiB/s, {} errors",
        settings.num_pages,
        settings.num_threads,
        result.bytes,
        result.elapsed,
        result.throughput_mibps,
        result.error_count
    );
    Ok(result)
}

fn run_on(qp: &mut QueuePair, dma: &dyn DmaProvider, settings: &BenchSettings) -> Result<BenchmarkResult> {
    let page_size = qp.page_size();
    let source_size = page_align(
        settings
            .num_threads
            .checked_mul(2 * page_size)
            .ok_or(DriverError::InvalidArgument)?,
        DMA_ALIGNMENT,
    );
    let source = allocate(dma, source_size, settings, DmaOptions::ZERO)?;

    let bytes = settings
        .num_pages
        .checked_mul(page_size)
        .ok_or_else(|| {
            error!("bench: {} pages of {} bytes overflow", settings.num_pages, page_size);
            DriverError::InvalidArgument
        })?;
    let mut destination = Vec::new();
    destination.try_reserve_exact(bytes).map_err(|_| {
        error!("bench: failed to allocate a {} byte destination buffer", bytes);
        DriverError::OutOfMemory
    })?;
    destination.resize(bytes, 0);

    let mut error_count = 0;
    let start = Instant::now();
    let stats = read_pages(
        qp,
        &source,
        &mut destination,
        settings.num_pages,
        settings.num_threads,
        settings.start_block,
        &mut error_count,
    )?;
    let elapsed = start.elapsed();

    Ok(BenchmarkResult {
        throughput_mibps: throughput_mibps(bytes, elapsed),
        error_count,
        elapsed,
        bytes,
        stats,
        destination,
    })
}

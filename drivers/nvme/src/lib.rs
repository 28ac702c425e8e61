//! GPU 风格的 NVMe 读 I/O
//!
//! 一组线程通过一个 NVMe 队列对直接驱动设备读取，
//! 控制器初始化与 DMA 内存分配由外部协作者提供。

pub mod bench;
pub mod emu;
pub mod kernel;
pub mod logger;
pub mod nvme;


pub use bench::{BenchSettings, BenchmarkResult, run_benchmark};
pub use kernel::{KernelStats, read_pages};

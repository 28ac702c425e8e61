#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod dma;
pub mod iommu;
pub mod mmio;
pub mod ring;

use core::fmt;

// 重新导出常用类型
pub use dma::{DmaOptions, DmaProvider, DmaRegion, IoAddr, Topology, DMA_ALIGNMENT};
pub use iommu::IoMap;
pub use mmio::{Doorbell, MmioRegion};
pub use ring::{RingBuffer, RingEntry, RingSlots};

/// 队列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// 提交队列
    Submission,
    /// 完成队列
    Completion,
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Submission => f.write_str("submission queue"),
            QueueKind::Completion => f.write_str("completion queue"),
        }
    }
}

/// 驱动错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// 无效参数
    InvalidArgument,
    /// 内存不足
    OutOfMemory,
    /// 超时
    Timeout,
    /// 缓冲区太小
    BufferTooSmall,
    /// 队列已满
    QueueFull,
    /// IO 错误
    IoError,
    /// 不支持的操作
    NotSupported,
    /// 创建 I/O 队列的 admin 命令失败
    QueueCreation {
        qid: u16,
        kind: QueueKind,
        status: u16,
    },
    /// 删除 I/O 队列的 admin 命令失败
    QueueDeletion {
        qid: u16,
        kind: QueueKind,
        status: u16,
    },
    /// 门铃地址无法转换为设备可访问的地址
    DoorbellTranslation { host_addr: u64 },
    /// DMA 区域分配失败
    DmaAllocation { size: usize },
    /// 系统错误
    SystemError(i32),
}

pub type Result<T> = core::result::Result<T, DriverError>;

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DriverError::InvalidArgument => f.write_str("invalid argument"),
            DriverError::OutOfMemory => f.write_str("out of memory"),
            DriverError::Timeout => f.write_str("operation timed out"),
            DriverError::BufferTooSmall => f.write_str("buffer too small"),
            DriverError::QueueFull => f.write_str("queue is full"),
            DriverError::IoError => f.write_str("i/o error"),
            DriverError::NotSupported => f.write_str("operation not supported"),
            DriverError::QueueCreation { qid, kind, status } => write!(
                f,
                "failed to create {kind} {qid}: controller returned status {status:#06x}"
            ),
            DriverError::QueueDeletion { qid, kind, status } => write!(
                f,
                "failed to delete {kind} {qid}: controller returned status {status:#06x}"
            ),
            DriverError::DoorbellTranslation { host_addr } => write!(
                f,
                "failed to map doorbell register {host_addr:#x} into the device address space"
            ),
            DriverError::DmaAllocation { size } => {
                write!(f, "failed to allocate a {size} byte DMA region")
            }
            DriverError::SystemError(errno) => write!(f, "system error {errno}"),
        }
    }
}

impl core::error::Error for DriverError {}

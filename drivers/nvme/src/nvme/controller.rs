//! 控制器接口
//!
//! 控制器初始化、admin 队列和 namespace 识别由外部完成，
//! 这里只约定队列对建立所需要的最小接口。

use libdriver::{Doorbell, IoAddr, Result};

use super::command::{CompletionEntry, SubmissionEntry};
use super::regs::{cap, cq_doorbell_offset, sq_doorbell_offset};

/// 控制器信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerInfo {
    /// 内存页大小 (bytes)
    pub page_size: usize,
    /// 最大队列条目数
    pub max_queue_entries: u32,
    /// 门铃步长
    pub doorbell_stride: usize,
    /// BAR0 在主机 I/O 空间中的地址
    pub bar_base: IoAddr,
}

impl ControllerInfo {
    /// 从 CAP 寄存器值解析
    pub fn from_cap(cap: u64, bar_base: IoAddr) -> Self {
        Self {
            page_size: cap::mpsmin(cap),
            max_queue_entries: cap::mqes(cap),
            doorbell_stride: cap::dstrd(cap),
            bar_base,
        }
    }

    /// 队列 `qid` 的 SQ tail 门铃在主机 I/O 空间中的地址
    #[inline]
    pub fn sq_doorbell(&self, qid: u16) -> IoAddr {
        self.bar_base
            .add(sq_doorbell_offset(qid, self.doorbell_stride))
    }

    /// 队列 `qid` 的 CQ head 门铃在主机 I/O 空间中的地址
    #[inline]
    pub fn cq_doorbell(&self, qid: u16) -> IoAddr {
        self.bar_base
            .add(cq_doorbell_offset(qid, self.doorbell_stride))
    }
}

/// Namespace 信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// Namespace ID
    pub nsid: u32,
    /// 大小（块数）
    pub size: u64,
    /// 容量（字节）
    pub capacity: u64,
    /// 块大小
    pub block_size: u32,
    /// 格式化 LBA 大小索引
    pub formatted_lba_size: u8,
}

/// 已初始化的控制器
pub trait Controller {
    /// 控制器能力
    fn info(&self) -> ControllerInfo;

    /// 查询 namespace
    fn namespace(&self, nsid: u32) -> Result<NamespaceInfo>;

    /// 同步执行一条 admin 命令
    ///
    /// 命令被设备拒绝时仍返回 `Ok`，状态在完成条目中；
    /// `Err` 只表示命令没能送达设备。
    fn execute_admin(&self, entry: SubmissionEntry) -> Result<CompletionEntry>;
}

/// 将主机侧的门铃地址转换为计算核心可以直接写入的寄存器
pub trait DoorbellMapper {
    fn map_doorbell(&self, host_addr: IoAddr) -> Result<Doorbell>;
}

//! BAR0 寄存器布局

pub mod offsets {
    /// 第一个门铃 (admin SQ tail)
    pub const DOORBELL_BASE: usize = 0x1000;
}

/// CAP (Controller Capabilities) 寄存器位域
pub mod cap {
    /// Maximum Queue Entries Supported (bits 0-15), 0-based
    pub const MQES_MASK: u64 = 0xFFFF;
    /// Contiguous Queues Required (bit 16)
    pub const CQR: u64 = 1 << 16;
    /// Doorbell Stride (bits 32-35)
    pub const DSTRD_SHIFT: u64 = 32;
    pub const DSTRD_MASK: u64 = 0xF << 32;
    /// Memory Page Size Minimum (bits 48-51)
    pub const MPSMIN_SHIFT: u64 = 48;
    pub const MPSMIN_MASK: u64 = 0xF << 48;

    /// 提取最大队列条目数
    #[inline]
    pub fn mqes(cap: u64) -> u32 {
        (cap & MQES_MASK) as u32 + 1
    }

    /// 提取门铃步长
    #[inline]
    pub fn dstrd(cap: u64) -> usize {
        ((cap & DSTRD_MASK) >> DSTRD_SHIFT) as usize
    }

    /// 提取最小页大小 (bytes)
    #[inline]
    pub fn mpsmin(cap: u64) -> usize {
        1 << (12 + ((cap & MPSMIN_MASK) >> MPSMIN_SHIFT))
    }

    /// 构建 CAP 寄存器值
    ///
    /// `page_size` 必须是不小于 4 KiB 的 2 的幂。
    #[inline]
    pub fn build(max_queue_entries: u32, doorbell_stride: usize, page_size: usize) -> u64 {
        let mqes = (max_queue_entries.clamp(2, 65536) - 1) as u64;
        let mps = (page_size.trailing_zeros().saturating_sub(12) as u64) & 0xF;
        mqes | CQR | (((doorbell_stride as u64) << DSTRD_SHIFT) & DSTRD_MASK) | (mps << MPSMIN_SHIFT)
    }
}

/// 计算 SQ 门铃偏移
///
/// offset = 0x1000 + (2 * qid) * (4 << dstrd)
#[inline]
pub fn sq_doorbell_offset(qid: u16, dstrd: usize) -> usize {
    offsets::DOORBELL_BASE + (2 * qid as usize) * (4 << dstrd)
}

/// 计算 CQ 门铃偏移
///
/// offset = 0x1000 + (2 * qid + 1) * (4 << dstrd)
#[inline]
pub fn cq_doorbell_offset(qid: u16, dstrd: usize) -> usize {
    offsets::DOORBELL_BASE + (2 * qid as usize + 1) * (4 << dstrd)
}

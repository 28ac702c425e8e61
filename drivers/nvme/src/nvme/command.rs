//! NVMe 命令与完成条目

use core::mem::size_of;

use bitflags::bitflags;
use libdriver::RingEntry;

/// 命令操作码
pub mod opcode {
    // Admin 命令
    pub const ADMIN_DELETE_SQ: u8 = 0x00;
    pub const ADMIN_CREATE_SQ: u8 = 0x01;
    pub const ADMIN_DELETE_CQ: u8 = 0x04;
    pub const ADMIN_CREATE_CQ: u8 = 0x05;

    // I/O 命令
    pub const IO_READ: u8 = 0x02;
}

/// 完成状态，编码为 `SCT << 8 | SC`
pub mod status {
    pub const SUCCESS: u16 = 0x000;

    // Generic Command Status (SCT 0)
    pub const INVALID_OPCODE: u16 = 0x001;
    pub const INVALID_FIELD: u16 = 0x002;
    pub const DATA_TRANSFER_ERROR: u16 = 0x004;
    pub const INVALID_NAMESPACE: u16 = 0x00B;
    pub const LBA_OUT_OF_RANGE: u16 = 0x080;

    // Command Specific Status (SCT 1)
    pub const COMPLETION_QUEUE_INVALID: u16 = 0x100;
    pub const INVALID_QUEUE_ID: u16 = 0x101;
    pub const INVALID_QUEUE_SIZE: u16 = 0x102;
    pub const INVALID_QUEUE_DELETION: u16 = 0x10C;

    // Media and Data Integrity Errors (SCT 2)
    pub const UNRECOVERED_READ_ERROR: u16 = 0x281;
}

pub const SUBMISSION_ENTRY_SIZE: usize = 64;
pub const COMPLETION_ENTRY_SIZE: usize = 16;

bitflags! {
    /// Create I/O Queue 命令的 CDW11 低 16 位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueFlags: u16 {
        /// Physically Contiguous
        const PHYSICALLY_CONTIGUOUS = 1 << 0;
        /// Interrupts Enabled（仅 CQ）
        const INTERRUPTS_ENABLED = 1 << 1;
    }
}

/// NVMe 提交队列条目 (Submission Queue Entry)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SubmissionEntry {
    /// Opcode (CDW0[7:0])
    pub opcode: u8,
    /// Flags (CDW0[15:8]) - FUSE[1:0], reserved[5:2], PSDT[7:6]
    pub flags: u8,
    /// Command ID (CDW0[31:16])
    pub cid: u16,
    /// Namespace ID (CDW1)
    pub nsid: u32,
    /// Reserved (CDW2-3)
    pub _rsvd: u64,
    /// Metadata pointer (CDW4-5)
    pub mptr: u64,
    /// Data pointer - PRP1 (CDW6-7)
    pub dptr1: u64,
    /// Data pointer - PRP2 (CDW8-9)
    pub dptr2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(size_of::<SubmissionEntry>() == SUBMISSION_ENTRY_SIZE);

impl SubmissionEntry {
    /// 创建 Create I/O Completion Queue 命令
    pub fn create_io_cq(cid: u16, qid: u16, prp: u64, size: u16, flags: QueueFlags) -> Self {
        Self {
            opcode: opcode::ADMIN_CREATE_CQ,
            cid,
            dptr1: prp,
            cdw10: ((size as u32 - 1) << 16) | (qid as u32),
            cdw11: flags.bits() as u32,
            ..Default::default()
        }
    }

    /// 创建 Create I/O Submission Queue 命令
    pub fn create_io_sq(
        cid: u16,
        qid: u16,
        prp: u64,
        size: u16,
        cqid: u16,
        flags: QueueFlags,
    ) -> Self {
        Self {
            opcode: opcode::ADMIN_CREATE_SQ,
            cid,
            dptr1: prp,
            cdw10: ((size as u32 - 1) << 16) | (qid as u32),
            cdw11: ((cqid as u32) << 16) | flags.bits() as u32,
            ..Default::default()
        }
    }

    /// 创建 Delete I/O Submission Queue 命令
    pub fn delete_io_sq(cid: u16, qid: u16) -> Self {
        Self {
            opcode: opcode::ADMIN_DELETE_SQ,
            cid,
            cdw10: qid as u32,
            ..Default::default()
        }
    }

    /// 创建 Delete I/O Completion Queue 命令
    pub fn delete_io_cq(cid: u16, qid: u16) -> Self {
        Self {
            opcode: opcode::ADMIN_DELETE_CQ,
            cid,
            cdw10: qid as u32,
            ..Default::default()
        }
    }

    /// 创建 Read 命令
    ///
    /// `block_count` 取值 1..=65536，写入时转换为 0-based。
    pub fn read(cid: u16, nsid: u32, lba: u64, block_count: u32, prp1: u64, prp2: u64) -> Self {
        Self {
            opcode: opcode::IO_READ,
            cid,
            nsid,
            dptr1: prp1,
            dptr2: prp2,
            cdw10: lba as u32,
            cdw11: (lba >> 32) as u32,
            cdw12: (block_count - 1) & 0xFFFF,
            ..Default::default()
        }
    }

    /// 队列 ID（create/delete 命令）
    #[inline]
    pub fn qid(&self) -> u16 {
        (self.cdw10 & 0xFFFF) as u16
    }

    /// 队列深度（create 命令）
    #[inline]
    pub fn queue_size(&self) -> u32 {
        (self.cdw10 >> 16) + 1
    }

    /// 绑定的 CQ ID（Create I/O SQ）
    #[inline]
    pub fn cqid(&self) -> u16 {
        (self.cdw11 >> 16) as u16
    }

    /// 队列属性（create 命令）
    #[inline]
    pub fn queue_flags(&self) -> QueueFlags {
        QueueFlags::from_bits_truncate(self.cdw11 as u16)
    }

    /// 起始 LBA（Read）
    #[inline]
    pub fn lba(&self) -> u64 {
        ((self.cdw11 as u64) << 32) | self.cdw10 as u64
    }

    /// 块数量（Read）
    #[inline]
    pub fn block_count(&self) -> u32 {
        (self.cdw12 & 0xFFFF) + 1
    }
}

/// NVMe 完成队列条目 (Completion Queue Entry)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CompletionEntry {
    /// Command specific (DW0)
    pub dw0: u32,
    /// Reserved (DW1)
    pub dw1: u32,
    /// SQ Head Pointer (DW2[15:0]), SQ ID (DW2[31:16])
    pub sq_head_sqid: u32,
    /// Command ID (DW3[15:0]), Phase Tag (DW3[16]), Status (DW3[31:17])
    pub cid_status: u32,
}

const _: () = assert!(size_of::<CompletionEntry>() == COMPLETION_ENTRY_SIZE);

impl CompletionEntry {
    /// 构造完成条目（设备侧）
    pub fn new(sq_head: u16, sq_id: u16, cid: u16, phase: bool, status: u16) -> Self {
        Self {
            dw0: 0,
            dw1: 0,
            sq_head_sqid: ((sq_id as u32) << 16) | sq_head as u32,
            cid_status: ((status as u32 & 0x7FFF) << 17) | ((phase as u32) << 16) | cid as u32,
        }
    }

    /// 获取命令 ID
    #[inline]
    pub fn cid(&self) -> u16 {
        (self.cid_status & 0xFFFF) as u16
    }

    /// 获取 Phase Tag
    #[inline]
    pub fn phase(&self) -> bool {
        (self.cid_status >> 16) & 1 == 1
    }

    /// 获取状态码
    #[inline]
    pub fn status(&self) -> u16 {
        ((self.cid_status >> 17) & 0x7FFF) as u16
    }

    /// Status Code
    #[inline]
    pub fn status_code(&self) -> u8 {
        (self.status() & 0xFF) as u8
    }

    /// Status Code Type
    #[inline]
    pub fn status_type(&self) -> u8 {
        ((self.status() >> 8) & 0x7) as u8
    }

    /// 检查是否成功
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status_code() == 0 && self.status_type() == 0
    }

    /// 获取 SQ Head Pointer
    #[inline]
    pub fn sq_head(&self) -> u16 {
        (self.sq_head_sqid & 0xFFFF) as u16
    }

    /// 获取 SQ ID
    #[inline]
    pub fn sq_id(&self) -> u16 {
        ((self.sq_head_sqid >> 16) & 0xFFFF) as u16
    }
}

unsafe impl RingEntry for SubmissionEntry {}
unsafe impl RingEntry for CompletionEntry {}

#[cfg(test)]
mod test {
    use super::{status, CompletionEntry, QueueFlags, SubmissionEntry, opcode};

    #[test]
    fn read_command_layout() {
        let cmd = SubmissionEntry::read(7, 1, 0x1_2345_6789, 8, 0xdead_0000, 0);

        assert_eq!(cmd.opcode, opcode::IO_READ);
        assert_eq!(cmd.cid, 7);
        assert_eq!(cmd.cdw10, 0x2345_6789);
        assert_eq!(cmd.cdw11, 0x1);
        assert_eq!(cmd.cdw12, 7);
        assert_eq!(cmd.lba(), 0x1_2345_6789);
        assert_eq!(cmd.block_count(), 8);

        let max = SubmissionEntry::read(0, 1, 0, 65536, 0, 0);
        assert_eq!(max.cdw12, 0xFFFF);
        assert_eq!(max.block_count(), 65536);
    }

    #[test]
    fn create_queue_dwords() {
        let cq = SubmissionEntry::create_io_cq(0, 3, 0x1000, 256, QueueFlags::PHYSICALLY_CONTIGUOUS);
        assert_eq!(cq.cdw10, (255 << 16) | 3);
        assert_eq!(cq.cdw11, 1);
        assert_eq!(cq.queue_size(), 256);

        let sq = SubmissionEntry::create_io_sq(0, 3, 0x2000, 64, 3, QueueFlags::PHYSICALLY_CONTIGUOUS);
        assert_eq!(sq.cdw11, (3 << 16) | 1);
        assert_eq!(sq.cqid(), 3);
        assert_eq!(sq.qid(), 3);
        assert!(sq.queue_flags().contains(QueueFlags::PHYSICALLY_CONTIGUOUS));
    }

    #[test]
    fn completion_status_fields() {
        let ok = CompletionEntry::new(5, 2, 9, true, status::SUCCESS);
        assert!(ok.is_success());
        assert!(ok.phase());
        assert_eq!((ok.cid(), ok.sq_head(), ok.sq_id()), (9, 5, 2));

        let bad = CompletionEntry::new(0, 1, 3, false, status::UNRECOVERED_READ_ERROR);
        assert!(!bad.is_success());
        assert!(!bad.phase());
        assert_eq!(bad.status_type(), 2);
        assert_eq!(bad.status_code(), 0x81);
        assert_eq!(bad.status(), status::UNRECOVERED_READ_ERROR);
    }
}

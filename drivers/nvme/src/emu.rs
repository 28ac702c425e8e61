//! 软件模拟的 NVMe 设备
//!
//! [`HostDmaProvider`] 在主机堆上分配 DMA 区域，并在 [`IoMap`] 中登记
//! 它们的 I/O 地址。[`EmulatedController`] 实现 I/O 队列的 admin 命令，
//! 用一个工作线程模拟设备：读取 SQ tail 门铃，取出命令，把 namespace
//! 镜像中的块拷贝到 PRP1 指向的内存，再把完成条目写入 CQ。

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{BTreeMap, BTreeSet};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use libdriver::dma::{ReleaseFn, page_align};
use libdriver::{
    DMA_ALIGNMENT, DmaOptions, DmaProvider, DmaRegion, Doorbell, DriverError, IoAddr, IoMap,
    MmioRegion, Result, Topology,
};
use log::{debug, error, trace, warn};
use spin::{Mutex, RwLock};

use crate::nvme::command::{
    COMPLETION_ENTRY_SIZE, CompletionEntry, QueueFlags, SUBMISSION_ENTRY_SIZE, SubmissionEntry,
    opcode, status,
};
use crate::nvme::controller::{Controller, ControllerInfo, DoorbellMapper, NamespaceInfo};
use crate::nvme::regs::{cap, cq_doorbell_offset, offsets, sq_doorbell_offset};

/// 支持的队列数（含 admin 队列 0）
const MAX_QUEUES: u16 = 16;

/// 主机内存 DMA 提供者
pub struct HostDmaProvider {
    iomap: Arc<IoMap>,
    fail: AtomicBool,
}

impl HostDmaProvider {
    pub fn new(iomap: Arc<IoMap>) -> Self {
        Self {
            iomap,
            fail: AtomicBool::new(false),
        }
    }

    pub fn iomap(&self) -> &Arc<IoMap> {
        &self.iomap
    }

    /// 让之后的分配全部失败
    pub fn fail_allocations(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

impl DmaProvider for HostDmaProvider {
    fn allocate(
        &self,
        size: usize,
        device_id: u32,
        topology: Option<&Topology>,
        options: DmaOptions,
    ) -> Result<DmaRegion> {
        if size == 0 {
            return Err(DriverError::InvalidArgument);
        }
        if self.fail.load(Ordering::Relaxed) {
            error!("emu: refusing dma allocation of {} bytes", size);
            return Err(DriverError::DmaAllocation { size });
        }
        if let Some(topology) = topology {
            debug!(
                "emu: device {} on adapter {} segment {}",
                device_id, topology.adapter, topology.segment_id
            );
        }

        // 主机内存总是清零且 I/O 地址连续，`options` 只用于日志
        let len = page_align(size, DMA_ALIGNMENT);
        let layout =
            Layout::from_size_align(len, DMA_ALIGNMENT).map_err(|_| DriverError::InvalidArgument)?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(DriverError::DmaAllocation { size })?;

        let io_addr = self.iomap.reserve(len, DMA_ALIGNMENT);
        if let Err(err) = unsafe { self.iomap.map(io_addr, ptr, len) } {
            unsafe { dealloc(ptr.as_ptr(), layout) };
            return Err(err);
        }

        let io_addrs = (0..len / DMA_ALIGNMENT)
            .map(|page| io_addr.add(page * DMA_ALIGNMENT))
            .collect();
        let iomap = self.iomap.clone();
        let release: ReleaseFn = Box::new(move |ptr, _| {
            iomap.unmap(io_addr);
            unsafe { dealloc(ptr.as_ptr(), layout) };
        });

        debug!(
            "emu: device {} dma region of {} bytes at {} ({:?})",
            device_id, len, io_addr, options
        );
        unsafe { DmaRegion::from_raw_parts(ptr, len, DMA_ALIGNMENT, io_addrs, Some(release)) }
    }
}

/// 模拟设备配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorConfig {
    /// 内存页大小 (CAP.MPSMIN)
    pub page_size: usize,
    /// 逻辑块大小
    pub block_size: u32,
    /// 唯一的 namespace
    pub namespace_id: u32,
    /// CAP.MQES + 1
    pub max_queue_entries: u32,
    /// CAP.DSTRD
    pub doorbell_stride: usize,
    /// BAR0 的 I/O 地址
    pub bar_base: IoAddr,
    /// namespace 的块数
    pub capacity_blocks: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            page_size: 0x10000,
            block_size: 512,
            namespace_id: 1,
            max_queue_entries: 1024,
            doorbell_stride: 0,
            bar_base: IoAddr::new(0xfe00_0000),
            capacity_blocks: 1 << 17,
        }
    }
}

impl EmulatorConfig {
    fn image_len(&self) -> Option<usize> {
        usize::try_from(self.capacity_blocks)
            .ok()?
            .checked_mul(self.block_size as usize)
    }

    fn bar_size(&self) -> usize {
        offsets::DOORBELL_BASE + 2 * MAX_QUEUES as usize * (4 << self.doorbell_stride)
    }
}

/// 设备统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// 执行过的 I/O 命令数
    pub commands: u64,
    /// 状态不为成功的 I/O 命令数
    pub failed: u64,
    /// 观察到的 SQ 最大在途条目数
    pub max_outstanding: usize,
}

/// 生成 namespace 镜像：每 8 字节为 `lba << 32 | 块内字序号`
pub fn pattern_image(blocks: u64, block_size: u32) -> Vec<u8> {
    let mut image = vec![0u8; blocks as usize * block_size as usize];
    for (lba, block) in image.chunks_exact_mut(block_size as usize).enumerate() {
        for (index, word) in block.chunks_exact_mut(8).enumerate() {
            word.copy_from_slice(&(((lba as u64) << 32) | index as u64).to_le_bytes());
        }
    }
    image
}

struct DeviceSq {
    base: IoAddr,
    depth: u32,
    head: u32,
    cqid: u16,
}

struct DeviceCq {
    base: IoAddr,
    depth: u32,
    tail: u32,
    phase: bool,
}

#[derive(Default)]
struct Queues {
    sqs: BTreeMap<u16, DeviceSq>,
    cqs: BTreeMap<u16, DeviceCq>,
}

struct Device {
    config: EmulatorConfig,
    iomap: Arc<IoMap>,
    /// 门铃寄存器，存储由它和派生的门铃共同持有
    mmio: MmioRegion,
    image: Vec<u8>,
    queues: Mutex<Queues>,
    faults: RwLock<BTreeSet<u64>>,
    admin_failure: Mutex<Option<(u8, u16)>>,
    fail_doorbells: AtomicBool,
    commands: AtomicU64,
    failed: AtomicU64,
    max_outstanding: AtomicUsize,
    running: AtomicBool,
}

impl Device {
    fn register(&self, offset: usize) -> u32 {
        self.mmio.read_u32(offset).unwrap_or(0)
    }

    fn run(&self) {
        debug!("emu: device worker started");
        while self.running.load(Ordering::Acquire) {
            if !self.process() {
                thread::yield_now();
            }
        }
        debug!("emu: device worker stopped");
    }

    /// 处理所有 SQ 中已经提交的命令，返回是否有进展
    fn process(&self) -> bool {
        let stride = self.config.doorbell_stride;
        let mut queues = self.queues.lock();
        let Queues { sqs, cqs } = &mut *queues;
        let mut progressed = false;

        for (&qid, sq) in sqs.iter_mut() {
            let Some(cq) = cqs.get_mut(&sq.cqid) else {
                continue;
            };

            let tail = self.register(sq_doorbell_offset(qid, stride));
            if tail >= sq.depth {
                continue;
            }
            let outstanding = ((tail + sq.depth - sq.head) % sq.depth) as usize;
            self.max_outstanding.fetch_max(outstanding, Ordering::Relaxed);

            let cq_head = self.register(cq_doorbell_offset(sq.cqid, stride));
            while sq.head != tail {
                if (cq.tail + 1) % cq.depth == cq_head {
                    // CQ 已满，等主机释放
                    break;
                }

                let slot = sq.base.add(sq.head as usize * SUBMISSION_ENTRY_SIZE);
                let Some(ptr) = self.iomap.translate(slot, SUBMISSION_ENTRY_SIZE) else {
                    warn!("emu: submission queue {} slot {} is not mapped", qid, slot);
                    break;
                };
                let command = unsafe { (ptr.as_ptr() as *const SubmissionEntry).read_volatile() };

                sq.head = (sq.head + 1) % sq.depth;
                let status = self.execute(&command);
                let entry = CompletionEntry::new(sq.head as u16, qid, command.cid, cq.phase, status);
                self.post(cq, entry);
                progressed = true;
            }
        }

        progressed
    }

    fn execute(&self, command: &SubmissionEntry) -> u16 {
        self.commands.fetch_add(1, Ordering::Relaxed);
        let status = self.read(command);
        if status != status::SUCCESS {
            self.failed.fetch_add(1, Ordering::Relaxed);
            trace!("emu: command {} failed with status {:#x}", command.cid, status);
        }
        status
    }

    fn read(&self, command: &SubmissionEntry) -> u16 {
        if command.opcode != opcode::IO_READ {
            return status::INVALID_OPCODE;
        }
        if command.nsid != self.config.namespace_id {
            return status::INVALID_NAMESPACE;
        }

        let lba = command.lba();
        let count = command.block_count() as u64;
        let end = match lba.checked_add(count) {
            Some(end) if end <= self.config.capacity_blocks => end,
            _ => return status::LBA_OUT_OF_RANGE,
        };
        if self.faults.read().range(lba..end).next().is_some() {
            return status::UNRECOVERED_READ_ERROR;
        }

        let block_size = self.config.block_size as usize;
        let len = count as usize * block_size;
        let Some(target) = self.iomap.translate(IoAddr::new(command.dptr1), len) else {
            return status::DATA_TRANSFER_ERROR;
        };

        let start = lba as usize * block_size;
        let data = &self.image[start..start + len];
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), target.as_ptr(), len) };
        status::SUCCESS
    }

    /// 写入完成条目，DW3 最后写入
    fn post(&self, cq: &mut DeviceCq, entry: CompletionEntry) {
        let slot = cq.base.add(cq.tail as usize * COMPLETION_ENTRY_SIZE);
        let Some(ptr) = self.iomap.translate(slot, COMPLETION_ENTRY_SIZE) else {
            warn!("emu: completion queue slot {} is not mapped", slot);
            return;
        };

        let ptr = ptr.as_ptr() as *mut CompletionEntry;
        unsafe {
            (&raw mut (*ptr).dw0).write_volatile(entry.dw0);
            (&raw mut (*ptr).dw1).write_volatile(entry.dw1);
            (&raw mut (*ptr).sq_head_sqid).write_volatile(entry.sq_head_sqid);
            AtomicU32::from_ptr(&raw mut (*ptr).cid_status).store(entry.cid_status, Ordering::Release);
        }

        cq.tail = (cq.tail + 1) % cq.depth;
        if cq.tail == 0 {
            cq.phase = !cq.phase;
        }
    }

    fn admin(&self, entry: &SubmissionEntry) -> u16 {
        {
            let mut injected = self.admin_failure.lock();
            if let Some((op, status)) = *injected {
                if op == entry.opcode {
                    *injected = None;
                    return status;
                }
            }
        }

        match entry.opcode {
            opcode::ADMIN_CREATE_CQ => self.create_cq(entry),
            opcode::ADMIN_CREATE_SQ => self.create_sq(entry),
            opcode::ADMIN_DELETE_SQ => self.delete_sq(entry.qid()),
            opcode::ADMIN_DELETE_CQ => self.delete_cq(entry.qid()),
            _ => status::INVALID_OPCODE,
        }
    }

    /// 检查 create 命令中的队列属性，返回队列深度
    fn check_queue(&self, entry: &SubmissionEntry, entry_size: usize) -> core::result::Result<u32, u16> {
        let size = entry.queue_size();
        if size < 2 || size > self.config.max_queue_entries {
            return Err(status::INVALID_QUEUE_SIZE);
        }
        if !entry
            .queue_flags()
            .contains(QueueFlags::PHYSICALLY_CONTIGUOUS)
        {
            return Err(status::INVALID_FIELD);
        }
        if self
            .iomap
            .translate(IoAddr::new(entry.dptr1), size as usize * entry_size)
            .is_none()
        {
            return Err(status::INVALID_FIELD);
        }
        Ok(size)
    }

    fn create_cq(&self, entry: &SubmissionEntry) -> u16 {
        let qid = entry.qid();
        let mut queues = self.queues.lock();
        if qid == 0 || qid >= MAX_QUEUES || queues.cqs.contains_key(&qid) {
            return status::INVALID_QUEUE_ID;
        }
        let depth = match self.check_queue(entry, COMPLETION_ENTRY_SIZE) {
            Ok(depth) => depth,
            Err(status) => return status,
        };

        let _ = self
            .mmio
            .write_u32(cq_doorbell_offset(qid, self.config.doorbell_stride), 0);
        queues.cqs.insert(
            qid,
            DeviceCq {
                base: IoAddr::new(entry.dptr1),
                depth,
                tail: 0,
                phase: true,
            },
        );
        debug!(
            "emu: created completion queue {} with {} entries at {:#x}",
            qid, depth, entry.dptr1
        );
        status::SUCCESS
    }

    fn create_sq(&self, entry: &SubmissionEntry) -> u16 {
        let qid = entry.qid();
        let cqid = entry.cqid();
        let mut queues = self.queues.lock();
        if qid == 0 || qid >= MAX_QUEUES || queues.sqs.contains_key(&qid) {
            return status::INVALID_QUEUE_ID;
        }
        if cqid == 0 || !queues.cqs.contains_key(&cqid) {
            return status::COMPLETION_QUEUE_INVALID;
        }
        let depth = match self.check_queue(entry, SUBMISSION_ENTRY_SIZE) {
            Ok(depth) => depth,
            Err(status) => return status,
        };

        let _ = self
            .mmio
            .write_u32(sq_doorbell_offset(qid, self.config.doorbell_stride), 0);
        queues.sqs.insert(
            qid,
            DeviceSq {
                base: IoAddr::new(entry.dptr1),
                depth,
                head: 0,
                cqid,
            },
        );
        debug!(
            "emu: created submission queue {} with {} entries at {:#x}, completion queue {}",
            qid, depth, entry.dptr1, cqid
        );
        status::SUCCESS
    }

    fn delete_sq(&self, qid: u16) -> u16 {
        match self.queues.lock().sqs.remove(&qid) {
            Some(_) => status::SUCCESS,
            None => status::INVALID_QUEUE_ID,
        }
    }

    fn delete_cq(&self, qid: u16) -> u16 {
        let mut queues = self.queues.lock();
        if !queues.cqs.contains_key(&qid) {
            return status::INVALID_QUEUE_ID;
        }
        if queues.sqs.values().any(|sq| sq.cqid == qid) {
            return status::INVALID_QUEUE_DELETION;
        }
        queues.cqs.remove(&qid);
        status::SUCCESS
    }
}

/// 模拟的 NVMe 控制器
///
/// 通过 [`DoorbellMapper`] 得到的 [`Doorbell`] 与控制器共同持有门铃寄存器；
/// 控制器释放之后写门铃不再被设备处理。
pub struct EmulatedController {
    device: Arc<Device>,
    worker: Option<JoinHandle<()>>,
}

impl EmulatedController {
    /// 用 [`pattern_image`] 填充 namespace
    pub fn new(config: EmulatorConfig, iomap: Arc<IoMap>) -> Result<Self> {
        if config.image_len().is_none() {
            error!("emu: namespace of {} blocks does not fit in memory", config.capacity_blocks);
            return Err(DriverError::InvalidArgument);
        }
        let image = pattern_image(config.capacity_blocks, config.block_size);
        Self::with_image(config, iomap, image)
    }

    pub fn with_image(config: EmulatorConfig, iomap: Arc<IoMap>, image: Vec<u8>) -> Result<Self> {
        if config.page_size < 4096
            || !config.page_size.is_power_of_two()
            || config.block_size < 8
            || !config.block_size.is_power_of_two()
            || config.doorbell_stride > 0xF
            || config.max_queue_entries < 2
            || config.image_len() != Some(image.len())
        {
            error!("emu: invalid emulator configuration {:?}", config);
            return Err(DriverError::InvalidArgument);
        }

        let bar: Arc<Vec<AtomicU32>> =
            Arc::new((0..config.bar_size() / 4).map(|_| AtomicU32::new(0)).collect());
        let base = NonNull::new(bar.as_ptr() as *mut u8).ok_or(DriverError::OutOfMemory)?;
        let mmio =
            unsafe { MmioRegion::with_owner(base, config.bar_size(), config.bar_base, bar)? };

        let device = Arc::new(Device {
            config,
            iomap,
            mmio,
            image,
            queues: Mutex::new(Queues::default()),
            faults: RwLock::new(BTreeSet::new()),
            admin_failure: Mutex::new(None),
            fail_doorbells: AtomicBool::new(false),
            commands: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            max_outstanding: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        });

        let worker = {
            let device = device.clone();
            thread::Builder::new()
                .name("nvme-emu".into())
                .spawn(move || device.run())
                .map_err(|err| {
                    error!("emu: failed to start device worker: {}", err);
                    DriverError::SystemError(err.raw_os_error().unwrap_or(0))
                })?
        };

        debug!(
            "emu: controller ready, page size {}, {} blocks of {} bytes",
            config.page_size, config.capacity_blocks, config.block_size
        );
        Ok(Self {
            device,
            worker: Some(worker),
        })
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.device.config
    }

    /// namespace 镜像
    pub fn image(&self) -> &[u8] {
        &self.device.image
    }

    /// 之后覆盖 `lba` 的读命令都以 Unrecovered Read Error 完成
    pub fn inject_read_fault(&self, lba: u64) {
        self.device.faults.write().insert(lba);
    }

    pub fn clear_read_faults(&self) {
        self.device.faults.write().clear();
    }

    /// 下一条 `opcode` admin 命令以 `status` 失败
    pub fn inject_admin_failure(&self, opcode: u8, status: u16) {
        *self.device.admin_failure.lock() = Some((opcode, status));
    }

    /// 让门铃地址转换失败
    pub fn fail_doorbell_mapping(&self, fail: bool) {
        self.device.fail_doorbells.store(fail, Ordering::Relaxed);
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            commands: self.device.commands.load(Ordering::Relaxed),
            failed: self.device.failed.load(Ordering::Relaxed),
            max_outstanding: self.device.max_outstanding.load(Ordering::Relaxed),
        }
    }

    /// 已创建的 (SQ, CQ) 数量
    pub fn queue_count(&self) -> (usize, usize) {
        let queues = self.device.queues.lock();
        (queues.sqs.len(), queues.cqs.len())
    }
}

impl Controller for EmulatedController {
    fn info(&self) -> ControllerInfo {
        let config = &self.device.config;
        let cap = cap::build(
            config.max_queue_entries,
            config.doorbell_stride,
            config.page_size,
        );
        ControllerInfo::from_cap(cap, config.bar_base)
    }

    fn namespace(&self, nsid: u32) -> Result<NamespaceInfo> {
        let config = &self.device.config;
        if nsid != config.namespace_id {
            error!("emu: namespace {} does not exist", nsid);
            return Err(DriverError::InvalidArgument);
        }
        Ok(NamespaceInfo {
            nsid,
            size: config.capacity_blocks,
            capacity: config.capacity_blocks * config.block_size as u64,
            block_size: config.block_size,
            formatted_lba_size: 0,
        })
    }

    fn execute_admin(&self, entry: SubmissionEntry) -> Result<CompletionEntry> {
        let status = self.device.admin(&entry);
        Ok(CompletionEntry::new(0, 0, entry.cid, true, status))
    }
}

impl DoorbellMapper for EmulatedController {
    fn map_doorbell(&self, host_addr: IoAddr) -> Result<Doorbell> {
        let mmio = &self.device.mmio;
        let fault = DriverError::DoorbellTranslation {
            host_addr: host_addr.as_u64(),
        };

        if self.device.fail_doorbells.load(Ordering::Relaxed) || !mmio.contains(host_addr) {
            return Err(fault);
        }
        let offset = (host_addr.as_u64() - mmio.phys_addr().as_u64()) as usize;
        if offset < offsets::DOORBELL_BASE {
            return Err(fault);
        }
        mmio.doorbell(offset).map_err(|_| fault)
    }
}

impl Drop for EmulatedController {
    fn drop(&mut self) {
        self.device.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

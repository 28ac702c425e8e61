use std::process::ExitCode;
use std::sync::Arc;

use libdriver::{IoAddr, IoMap};
use log::error;
use nvme_gpu::bench::{BenchSettings, run_benchmark};
use nvme_gpu::emu::{EmulatedController, EmulatorConfig, HostDmaProvider};
use nvme_gpu::logger;

/// 模拟设备的 I/O 地址从这里开始分配
const IO_BASE: u64 = 0x1_0000_0000;

fn main() -> ExitCode {
    if logger::init().is_err() {
        return ExitCode::FAILURE;
    }

    match bench_main() {
        Ok(errors) if errors == 0 => ExitCode::SUCCESS,
        Ok(errors) => {
            error!("nvme: {} read commands failed", errors);
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("nvme: benchmark aborted: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn bench_main() -> libdriver::Result<u64> {
    let iomap = Arc::new(IoMap::new(IoAddr::new(IO_BASE)));
    let config = EmulatorConfig::default();
    let controller = EmulatedController::new(config, iomap.clone())?;
    let dma = HostDmaProvider::new(iomap);

    let settings = BenchSettings::default().with_namespace(config.namespace_id);
    let result = run_benchmark(&controller, &controller, &dma, &settings)?;

    println!(
        "{:.2} MiB/s, {} errors, {} batches, peak {} outstanding",
        result.throughput_mibps, result.error_count, result.stats.batches, result.stats.peak_outstanding
    );
    Ok(result.error_count)
}

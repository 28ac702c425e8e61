use std::env;
use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError, set_logger, set_max_level};

/// 控制日志级别的环境变量
pub const LOG_ENV: &str = "NVME_GPU_LOG";

static LOGGER: Logger = Logger;

/// 安装 stderr 日志，级别取自 [`LOG_ENV`]，默认 `info`
pub fn init() -> Result<(), SetLoggerError> {
    set_logger(&LOGGER)?;
    set_max_level(level_from_env(env::var(LOG_ENV).ok().as_deref()));
    Ok(())
}

fn level_from_env(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(LevelFilter::Info)
}

pub struct Logger;

impl Logger {
    fn log_message(&self, record: &Record) {
        let prefix = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let _ = writeln!(std::io::stderr().lock(), "[{}] {}", prefix, record.args());
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.log_message(record);
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[cfg(test)]
mod test {
    use log::LevelFilter;

    use super::level_from_env;

    #[test]
    fn level_defaults_to_info() {
        assert_eq!(level_from_env(None), LevelFilter::Info);
        assert_eq!(level_from_env(Some("nonsense")), LevelFilter::Info);
        assert_eq!(level_from_env(Some("trace")), LevelFilter::Trace);
        assert_eq!(level_from_env(Some(" Debug ")), LevelFilter::Debug);
        assert_eq!(level_from_env(Some("off")), LevelFilter::Off);
    }
}

use conquer_once::spin::OnceCell;
use log::{LevelFilter, Log, Metadata, Record};

static CONSOLE_LOGGER: OnceCell<ConsoleLogger> = OnceCell::uninit();

/// Writes every enabled record to stderr, one line each.
pub struct ConsoleLogger {
    level: LevelFilter,
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:>5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the console logger. Only the first call has any effect.
pub fn init(level: LevelFilter) -> anyhow::Result<()> {
    if CONSOLE_LOGGER.is_initialized() {
        return Ok(());
    }
    let logger = CONSOLE_LOGGER.get_or_init(|| ConsoleLogger { level });
    log::set_logger(logger).map_err(|_| anyhow::anyhow!("a logger is already installed"))?;
    log::set_max_level(level);
    Ok(())
}

use chrono::Utc;
use colored::*;
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

struct ColoredLogger;

impl log::Log for ColoredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("{}", format_record(record));
        }
    }

    fn flush(&self) {}
}

fn format_record(record: &Record) -> String {
    let level = match record.level() {
        Level::Error => record.level().to_string().red(),
        Level::Warn => record.level().to_string().yellow(),
        Level::Info => record.level().to_string().green(),
        Level::Debug => record.level().to_string().blue(),
        Level::Trace => record.level().to_string().purple(),
    };

    format!(
        "{} {} [{}] {}",
        Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string().dimmed(),
        level,
        record.target(),
        record.args()
    )
}

static LOGGER: ColoredLogger = ColoredLogger;

pub fn init_logger(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(level))
}

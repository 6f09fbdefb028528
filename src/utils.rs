use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

// Logging and terminal helpers shared by the console binary

/// Appends timestamped records to a log file, keeping them out of the
/// conversation view.
pub struct ChatLogger {
    log_file: Mutex<File>,
}

impl ChatLogger {
    pub fn new(log_file_path: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(log_file_path)?;
        Ok(ChatLogger { log_file: Mutex::new(file) })
    }

    fn format(record: &Record) -> String {
        let now: DateTime<Local> = Local::now();
        format!(
            "[{}] {} [{}:{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    }
}

impl log::Log for ChatLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut file) = self.log_file.lock() {
            let _ = file.write_all(Self::format(record).as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.log_file.lock() {
            let _ = file.flush();
        }
    }
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Log to `log_file` when given, otherwise to stderr through env_logger
/// (`RUST_LOG` still applies on top of `level`).
pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    match log_file {
        Some(path) => {
            let logger = ChatLogger::new(path)?;
            log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;
        }
        None => {
            env_logger::Builder::new()
                .filter_level(level)
                .parse_default_env()
                .try_init()?;
        }
    }

    log::info!("Logging initialized at level: {}", level);
    log::info!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    Ok(())
}

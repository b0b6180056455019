//! Log output for the daemon binaries: stderr plus a best-effort append to
//! the configured log file. A failed file write never panics and never
//! takes the daemon down.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use log::{LevelFilter, Metadata, Record};

struct NetdLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl log::Log for NetdLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!(
            "[{} {:5} {}] {}",
            ccnet_proto::now_millis(),
            record.level(),
            record.target(),
            record.args()
        );

        eprintln!("{line}");

        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

/// Installs the global logger. The file target is optional and opened in
/// append mode; an unopenable file degrades to stderr-only.
pub fn init(level: LevelFilter, file: Option<&Path>) {
    let file = file.and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(Mutex::new(file)),
            Err(err) => {
                eprintln!("netd: cannot open log file {}: {err}", path.display());
                None
            }
        }
    });

    let logger = Box::new(NetdLogger { level, file });

    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

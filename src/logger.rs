// Copyright 2026 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Append-only file logger behind the `log` facade. When no log file is
//! configured the facade stays uninitialised and every log macro is a no-op.

use chrono::Local;
use log::{LevelFilter, Metadata, Record};

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

struct FileLogger {
    // `log::Log` demands `Sync`; the helper itself is single-threaded so the
    // lock is never contended
    file: Mutex<File>,
}

/// Install the file logger if `CRSH_LOGFILE` names a writable path. Logging
/// is best-effort: an unopenable path leaves the facade uninitialised.
pub fn init() {
    let path = match std::env::var(crate::config::ENV_LOG_FILE) {
        Ok(path) if !path.is_empty() => path,
        _ => return,
    };

    if let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) {
        let logger = FileLogger {
            file: Mutex::new(file),
        };
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    }
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(
                file,
                "[{}] {:<5} {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

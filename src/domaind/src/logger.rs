// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Line-buffered logger for the daemon.
//!
//! Writes one line per record, prefixed with the instance id, the level
//! and the thread name, to a file or stderr. Installed once, before any
//! other thread starts.

use std::fs::OpenOptions;
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// The default instance id used before one is configured.
pub const DEFAULT_INSTANCE_ID: &str = "anonymous-instance";

static LOGGER: OnceLock<DaemonLogger> = OnceLock::new();

struct DaemonLogger {
    instance_id: String,
    writer: Mutex<LineWriter<Box<dyn Write + Send>>>,
}

impl Log for DaemonLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let thread = std::thread::current();
        let line = format!(
            "{} {:>5} [{}] {}",
            self.instance_id,
            level_str(record.level()),
            thread.name().unwrap_or("-"),
            record.args()
        );
        let mut writer = self.writer.lock().expect("logger lock poisoned");
        let _ = writeln!(writer, "{}", line);
    }

    fn flush(&self) {
        let mut writer = self.writer.lock().expect("logger lock poisoned");
        let _ = writer.flush();
    }
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Installs the process-wide logger. A second call is an error.
pub fn init(
    instance_id: &str,
    level: LevelFilter,
    log_path: Option<&Path>,
) -> io::Result<()> {
    let sink: Box<dyn Write + Send> = match log_path {
        Some(path) => Box::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        ),
        None => Box::new(io::stderr()),
    };
    let logger = DaemonLogger {
        instance_id: instance_id.to_string(),
        writer: Mutex::new(LineWriter::new(sink)),
    };
    LOGGER
        .set(logger)
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "logger already installed"))?;
    log::set_logger(LOGGER.get().expect("logger just installed"))
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_str() {
        assert_eq!(level_str(Level::Error), "ERROR");
        assert_eq!(level_str(Level::Trace), "TRACE");
    }
}

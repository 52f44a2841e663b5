//! Helpers shared by the unit tests.

use std::{
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Logger that keeps every record in memory so tests can look for warnings.
struct CaptureLogger {
    records: Mutex<Vec<(Level, String)>>,
}

static LOGGER: CaptureLogger = CaptureLogger {
    records: Mutex::new(Vec::new()),
};

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.records
            .lock()
            .expect("Poisoned lock!")
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

/// Installs the capturing logger. Safe to call from every test, only the first call counts.
pub fn init_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Whether a warning containing `needle` was logged by any test so far.
pub fn logged_warning(needle: &str) -> bool {
    LOGGER
        .records
        .lock()
        .expect("Poisoned lock!")
        .iter()
        .any(|(level, message)| *level == Level::Warn && message.contains(needle))
}

/// Polls `condition` until it holds or `timeout` runs out.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

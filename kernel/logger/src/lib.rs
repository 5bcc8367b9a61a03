//! The kernel's backend for the `log` facade.
//!
//! Messages go two places: to every registered sink (typically the
//! serial port; a framebuffer console can be added later), and into a
//! fixed-size in-memory [`LogRing`] holding the most recent lines. The
//! ring needs no allocation and survives as long as the kernel image
//! does, which is exactly what a post-mortem debugger or a panic dump
//! wants to walk.

#![no_std]

mod ring;

pub use ring::{LogRing, MAX_RECORD_LENGTH};

use core::fmt::Write;

use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;
use sync_irq::IrqSafeMutex;

/// A destination for formatted log lines (e.g., the serial port).
pub type LogSink = fn(&str);

const MAX_SINKS: usize = 4;

/// The number of recent messages the ring retains.
const LOG_RING_ROWS: usize = 256;

struct KernelLogger {
    sinks: Mutex<[Option<LogSink>; MAX_SINKS]>,
    ring: IrqSafeMutex<LogRing<LOG_RING_ROWS>>,
}

static LOGGER: KernelLogger = KernelLogger {
    sinks: Mutex::new([None; MAX_SINKS]),
    ring: IrqSafeMutex::new(LogRing::new()),
};

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = ring::RecordBuffer::new();
        let _ = write!(
            line,
            "[{}] {}: {}",
            level_tag(record.level()),
            record.target(),
            record.args(),
        );

        self.ring.lock().push(line.as_str());

        for sink in self.sinks.lock().iter().flatten() {
            sink(line.as_str());
        }
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "E",
        Level::Warn => "W",
        Level::Info => "I",
        Level::Debug => "D",
        Level::Trace => "T",
    }
}

/// Installs the kernel logger as the `log` facade's backend.
/// Safe to call more than once; only the first call wins.
pub fn init(max_level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(max_level);
}

/// Adds a sink that receives every formatted line from now on.
pub fn add_sink(sink: LogSink) -> Result<(), &'static str> {
    let mut sinks = LOGGER.sinks.lock();
    for slot in sinks.iter_mut() {
        if slot.is_none() {
            *slot = Some(sink);
            return Ok(());
        }
    }
    Err("logger: all sink slots are in use")
}

/// Calls `f` with every retained message, oldest first.
pub fn for_each_recent_message(mut f: impl FnMut(&str)) {
    LOGGER.ring.lock().for_each(|line| f(line));
}

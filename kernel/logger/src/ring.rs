//! A fixed-size ring of recent log lines.

use core::fmt;

/// Longest message retained per record; longer lines are truncated at a
/// UTF-8 boundary.
pub const MAX_RECORD_LENGTH: usize = 240;

#[derive(Clone, Copy)]
struct LogRecord {
    message: [u8; MAX_RECORD_LENGTH],
    length: usize,
}

impl LogRecord {
    const fn empty() -> LogRecord {
        LogRecord { message: [0; MAX_RECORD_LENGTH], length: 0 }
    }

    fn as_str(&self) -> &str {
        // Only ever filled from `&str` data at a char boundary.
        core::str::from_utf8(&self.message[..self.length]).unwrap_or("<invalid utf8>")
    }
}

/// The last `ROWS` log lines, oldest first when iterated. Writing wraps
/// around and overwrites the oldest record.
pub struct LogRing<const ROWS: usize> {
    records: [LogRecord; ROWS],
    /// Index of the next record to write.
    next: usize,
    wrapped: bool,
}

impl<const ROWS: usize> LogRing<ROWS> {
    pub const fn new() -> LogRing<ROWS> {
        LogRing {
            records: [LogRecord::empty(); ROWS],
            next: 0,
            wrapped: false,
        }
    }

    /// Appends one line, truncating it to [`MAX_RECORD_LENGTH`].
    pub fn push(&mut self, line: &str) {
        let record = &mut self.records[self.next];
        let length = truncated_length(line, MAX_RECORD_LENGTH);
        record.message[..length].copy_from_slice(&line.as_bytes()[..length]);
        record.length = length;

        self.next += 1;
        if self.next == ROWS {
            self.next = 0;
            self.wrapped = true;
        }
    }

    pub fn len(&self) -> usize {
        if self.wrapped {
            ROWS
        } else {
            self.next
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every retained line, oldest first.
    pub fn for_each(&self, mut f: impl FnMut(&str)) {
        let (first, count) = if self.wrapped {
            (self.next, ROWS)
        } else {
            (0, self.next)
        };
        for i in 0..count {
            f(self.records[(first + i) % ROWS].as_str());
        }
    }
}

/// The longest prefix of `line` that fits in `max` bytes, ending on a
/// char boundary.
fn truncated_length(line: &str, max: usize) -> usize {
    if line.len() <= max {
        return line.len();
    }
    let mut length = max;
    while !line.is_char_boundary(length) {
        length -= 1;
    }
    length
}

/// A stack buffer that formats one record without allocating.
pub(crate) struct RecordBuffer {
    bytes: [u8; MAX_RECORD_LENGTH],
    length: usize,
}

impl RecordBuffer {
    pub(crate) fn new() -> RecordBuffer {
        RecordBuffer { bytes: [0; MAX_RECORD_LENGTH], length: 0 }
    }

    pub(crate) fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.length]).unwrap_or("<invalid utf8>")
    }
}

impl fmt::Write for RecordBuffer {
    /// Writes as much as fits; the rest of the line is dropped rather
    /// than erroring, since a truncated log line is better than none.
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = MAX_RECORD_LENGTH - self.length;
        let length = truncated_length(s, remaining);
        self.bytes[self.length..self.length + length].copy_from_slice(&s.as_bytes()[..length]);
        self.length += length;
        Ok(())
    }
}

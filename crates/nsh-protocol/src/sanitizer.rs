//! Byte-in/line-out transducer applied to the remote job's raw stderr
//! stream before any of it reaches the parent's build-log descriptor.
//!
//! `\r` resets the in-progress line (overwriting semantics, matching a
//! terminal's carriage-return behavior); `\n` flushes the in-progress line
//! unless it is exactly the sentinel, in which case the stream is
//! considered cleanly finished.

use thiserror::Error;

pub const SENTINEL: &str = "@nsh done";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("log output exceeded the configured size limit")]
    LogLimitExceeded,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SanitizerOutcome {
    pub lines: Vec<String>,
    pub terminator_seen: bool,
}

pub struct LogSanitizer {
    buffer: Vec<u8>,
    cursor: usize,
    cumulative_bytes: u64,
    max_log_size: u64,
    terminator_seen: bool,
}

impl LogSanitizer {
    /// `max_log_size == 0` means unlimited, matching the `max-log-size`
    /// configuration key.
    pub fn new(max_log_size: u64) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            cumulative_bytes: 0,
            max_log_size,
            terminator_seen: false,
        }
    }

    pub fn terminator_seen(&self) -> bool {
        self.terminator_seen
    }

    /// Feeds more raw bytes in. Once the sentinel line has been observed,
    /// further calls are no-ops (the caller is expected to stop the tail
    /// once `terminator_seen` is true).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<SanitizerOutcome, Error> {
        let mut lines = Vec::new();
        if self.terminator_seen {
            return Ok(SanitizerOutcome {
                lines,
                terminator_seen: true,
            });
        }
        for &byte in bytes {
            self.cumulative_bytes += 1;
            if self.max_log_size > 0 && self.cumulative_bytes > self.max_log_size {
                return Err(Error::LogLimitExceeded);
            }
            match byte {
                b'\r' => self.cursor = 0,
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.buffer[..self.cursor]).into_owned();
                    self.buffer.clear();
                    self.cursor = 0;
                    if line == SENTINEL {
                        self.terminator_seen = true;
                        return Ok(SanitizerOutcome {
                            lines,
                            terminator_seen: true,
                        });
                    }
                    lines.push(line);
                }
                other => {
                    if self.cursor < self.buffer.len() {
                        self.buffer[self.cursor] = other;
                    } else {
                        self.buffer.push(other);
                    }
                    self.cursor += 1;
                }
            }
        }
        Ok(SanitizerOutcome {
            lines,
            terminator_seen: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_emitted() {
        let mut s = LogSanitizer::new(0);
        let out = s.feed(b"hello\nworld\n").unwrap();
        assert_eq!(out.lines, vec!["hello".to_string(), "world".to_string()]);
        assert!(!out.terminator_seen);
    }

    #[test]
    fn carriage_return_truncates_in_progress_line() {
        let mut s = LogSanitizer::new(0);
        let out = s.feed(b"abc\rdef\n").unwrap();
        assert_eq!(out.lines, vec!["def".to_string()]);
    }

    #[test]
    fn sentinel_line_is_not_emitted_and_sets_flag() {
        let mut s = LogSanitizer::new(0);
        let out = s.feed(b"last line\n@nsh done\n").unwrap();
        assert_eq!(out.lines, vec!["last line".to_string()]);
        assert!(out.terminator_seen);
        assert!(s.terminator_seen());
    }

    #[test]
    fn feeding_byte_by_byte_matches_feeding_whole() {
        let whole_input = b"abc\rdef\nghi\n";
        let mut whole = LogSanitizer::new(0);
        let whole_out = whole.feed(whole_input).unwrap();

        let mut piecewise = LogSanitizer::new(0);
        let mut piecewise_lines = Vec::new();
        for &b in whole_input {
            let out = piecewise.feed(&[b]).unwrap();
            piecewise_lines.extend(out.lines);
        }
        assert_eq!(whole_out.lines, piecewise_lines);
    }

    #[test]
    fn size_cap_is_enforced_exactly_once() {
        let mut s = LogSanitizer::new(4);
        let first = s.feed(b"ab");
        assert!(first.is_ok());
        let second = s.feed(b"cd");
        assert!(second.is_ok());
        let third = s.feed(b"e");
        assert_eq!(third.unwrap_err(), Error::LogLimitExceeded);
    }

    #[test]
    fn after_terminator_further_feeds_are_ignored() {
        let mut s = LogSanitizer::new(0);
        s.feed(b"@nsh done\n").unwrap();
        let out = s.feed(b"more stuff\n").unwrap();
        assert!(out.lines.is_empty());
        assert!(out.terminator_seen);
    }
}

//! Error taxonomy shared by every component of the interpreter.
//!
//! All failures are values of the single [`Error`] enum; there is no panic
//! path outside of tests. Each variant carries a human message, an optional
//! absolute byte position, and an optional 32-byte window of the surrounding
//! input rendered as a hex/ASCII dump with a `<--` marker at the faulting
//! byte.
//!
//! # Variants
//!
//! - [`Error::EndOfStream`]: a read ran past the logical end of a stream.
//! - [`Error::Parse`]: malformed input, expression type mismatches, unknown
//!   methods, unresolved types or enums, missing parameters.
//! - [`Error::Validation`]: schema well-formedness failures and
//!   `contents`/`valid` mismatches during interpretation.
//! - [`Error::NotImplemented`]: reserved for codec algorithms the
//!   interpreter recognizes but does not carry.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unexpected end of stream{0}")]
    EndOfStream(Details),

    #[error("parse error: {0}")]
    Parse(Details),

    #[error("validation error: {0}")]
    Validation(Details),

    #[error("not implemented: {0}")]
    NotImplemented(Details),
}

/// Discriminant of an [`Error`], usable without matching on payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    EndOfStream,
    Parse,
    Validation,
    NotImplemented,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EndOfStream => "EndOfStream",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::NotImplemented => "NotImplemented",
        }
    }
}

/// Message plus optional position and input context carried by every variant.
#[derive(Debug, Default)]
pub struct Details {
    pub message: String,
    pub pos: Option<u64>,
    pub context: Option<ContextWindow>,
}

impl fmt::Display for Details {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(pos) = self.pos {
            write!(f, " (at byte {pos})")?;
        }
        if let Some(window) = &self.context {
            write!(f, "\n{window}")?;
        }
        Ok(())
    }
}

/// Up to 32 bytes of input surrounding a fault position.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    /// Absolute offset of `bytes[0]` in the stream's region.
    pub window_start: u64,
    /// The captured slice, at most 32 bytes.
    pub bytes: Vec<u8>,
    /// Absolute offset of the faulting byte. May be one past the last
    /// captured byte when the fault is the end of the region itself.
    pub fault: u64,
}

impl fmt::Display for ContextWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (row_idx, row) in self.bytes.chunks(16).enumerate() {
            let row_start = self.window_start + (row_idx as u64) * 16;
            write!(f, "  {row_start:06x}  ")?;
            for (i, b) in row.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{b:02x}")?;
            }
            for _ in row.len()..16 {
                write!(f, "   ")?;
            }
            write!(f, "  |")?;
            for b in row {
                let c = if b.is_ascii_graphic() || *b == b' ' {
                    *b as char
                } else {
                    '.'
                };
                write!(f, "{c}")?;
            }
            writeln!(f, "|")?;

            let row_end = row_start + row.len() as u64;
            if self.fault >= row_start && self.fault < row_end {
                let col = (self.fault - row_start) as usize;
                writeln!(f, "  {:6}  {}^^ <-- 0x{:x}", "", "   ".repeat(col), self.fault)?;
            }
        }
        if self.fault >= self.window_start + self.bytes.len() as u64 {
            writeln!(f, "  (fault at 0x{:x}, past end of data)", self.fault)?;
        }
        Ok(())
    }
}

impl Error {
    pub fn eos(pos: u64) -> Self {
        Error::EndOfStream(Details {
            message: String::new(),
            pos: Some(pos),
            context: None,
        })
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Error::Parse(Details {
            message: message.into(),
            ..Details::default()
        })
    }

    pub fn parse_at(message: impl Into<String>, pos: u64) -> Self {
        Error::Parse(Details {
            message: message.into(),
            pos: Some(pos),
            context: None,
        })
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(Details {
            message: message.into(),
            ..Details::default()
        })
    }

    pub fn validation_at(message: impl Into<String>, pos: u64) -> Self {
        Error::Validation(Details {
            message: message.into(),
            pos: Some(pos),
            context: None,
        })
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Error::NotImplemented(Details {
            message: message.into(),
            ..Details::default()
        })
    }

    /// Attaches a hex/ASCII context window, keeping everything else.
    pub fn with_context(mut self, window: ContextWindow) -> Self {
        self.details_mut().context = Some(window);
        self
    }

    /// Sets the byte position if the error does not already carry one.
    pub fn or_pos(mut self, pos: u64) -> Self {
        let details = self.details_mut();
        if details.pos.is_none() {
            details.pos = Some(pos);
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EndOfStream(_) => ErrorKind::EndOfStream,
            Error::Parse(_) => ErrorKind::Parse,
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotImplemented(_) => ErrorKind::NotImplemented,
        }
    }

    pub fn pos(&self) -> Option<u64> {
        self.details().pos
    }

    pub fn message(&self) -> &str {
        &self.details().message
    }

    fn details(&self) -> &Details {
        match self {
            Error::EndOfStream(d)
            | Error::Parse(d)
            | Error::Validation(d)
            | Error::NotImplemented(d) => d,
        }
    }

    fn details_mut(&mut self) -> &mut Details {
        match self {
            Error::EndOfStream(d)
            | Error::Parse(d)
            | Error::Validation(d)
            | Error::NotImplemented(d) => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eos_carries_position() {
        let err = Error::eos(12);
        assert_eq!(err.kind(), ErrorKind::EndOfStream);
        assert_eq!(err.pos(), Some(12));
        assert!(err.to_string().contains("at byte 12"));
    }

    #[test]
    fn or_pos_does_not_override() {
        let err = Error::parse_at("bad magic", 4).or_pos(99);
        assert_eq!(err.pos(), Some(4));
    }

    #[test]
    fn context_window_marks_faulting_byte() {
        let window = ContextWindow {
            window_start: 0,
            bytes: b"GIF89a".to_vec(),
            fault: 3,
        };
        let rendered = window.to_string();
        assert!(rendered.contains("47 49 46 38 39 61"), "hex row: {rendered}");
        assert!(rendered.contains("|GIF89a|"), "ascii column: {rendered}");
        assert!(rendered.contains("^^ <-- 0x3"), "marker: {rendered}");
    }

    #[test]
    fn context_window_reports_fault_past_end() {
        let window = ContextWindow {
            window_start: 0,
            bytes: vec![0xff, 0xfe],
            fault: 2,
        };
        assert!(window.to_string().contains("past end of data"));
    }

    #[test]
    fn kind_names_match_taxonomy() {
        assert_eq!(ErrorKind::Parse.as_str(), "ParseError");
        assert_eq!(ErrorKind::Validation.as_str(), "ValidationError");
    }
}

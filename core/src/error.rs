//! Typed errors for the transport core.
//!
//! Every error kind the transport can report is declared here as a static
//! [`ErrorDef`], so error codes are fixed at compile time. Runtime values
//! ([`Error`]) borrow their definition and may carry an overridden message
//! (for one-off texts such as an unsupported scheme) plus a debug tail
//! appended with [`Error::add_debug`].

use std::borrow::Cow;
use std::fmt;

/// Severity attached to an error definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd)]
pub enum ErrorLevel {
    Warn,
    Error,
    Fatal,
}

/// Numeric code segment, one per error family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorSegment {
    Stream = 1,
    Transport = 2,
    Security = 3,
    Config = 4,
    Kernel = 5,
    Temp = 6,
}

/// A compile-time error definition. The full numeric code is
/// `segment << 16 | index`.
#[derive(Debug)]
pub struct ErrorDef {
    pub segment: ErrorSegment,
    pub index: u16,
    pub level: ErrorLevel,
    pub message: &'static str,
}

impl ErrorDef {
    pub const fn new(
        segment: ErrorSegment, index: u16, level: ErrorLevel, message: &'static str,
    ) -> Self {
        Self { segment, index, level, message }
    }

    #[inline]
    pub const fn code(&self) -> u32 {
        (self.segment as u32) << 16 | self.index as u32
    }
}

// Stream
pub static ERR_STREAM: ErrorDef =
    ErrorDef::new(ErrorSegment::Stream, 1, ErrorLevel::Warn, "bad stream");

// Transport
pub static ERR_CONN_CLOSE: ErrorDef =
    ErrorDef::new(ErrorSegment::Transport, 1, ErrorLevel::Warn, "connection closed by peer");
pub static ERR_CONN_READ: ErrorDef =
    ErrorDef::new(ErrorSegment::Transport, 2, ErrorLevel::Warn, "connection read failed");
pub static ERR_CONN_WRITE: ErrorDef =
    ErrorDef::new(ErrorSegment::Transport, 3, ErrorLevel::Warn, "connection write failed");
pub static ERR_CONN_FD: ErrorDef =
    ErrorDef::new(ErrorSegment::Transport, 4, ErrorLevel::Warn, "fd operation failed");

// Security
pub static ERR_WS_DATA_NOT_BINARY: ErrorDef = ErrorDef::new(
    ErrorSegment::Security,
    1,
    ErrorLevel::Warn,
    "websocket data frame is not binary",
);
pub static ERR_WS_HANDSHAKE: ErrorDef =
    ErrorDef::new(ErrorSegment::Security, 2, ErrorLevel::Warn, "websocket handshake failed");
pub static ERR_WS_HANDSHAKE_TIMEOUT: ErrorDef = ErrorDef::new(
    ErrorSegment::Security,
    3,
    ErrorLevel::Fatal,
    "websocket handshake timeout",
);

// Config
pub static ERR_BIND: ErrorDef =
    ErrorDef::new(ErrorSegment::Config, 1, ErrorLevel::Fatal, "bind failed");
pub static ERR_INVALID_ADDR: ErrorDef =
    ErrorDef::new(ErrorSegment::Config, 2, ErrorLevel::Fatal, "invalid address");
pub static ERR_UNSUPPORTED_PROTOCOL: ErrorDef =
    ErrorDef::new(ErrorSegment::Config, 3, ErrorLevel::Fatal, "unsupported protocol");

// Kernel
pub static ERR_KERNEL: ErrorDef = ErrorDef::new(
    ErrorSegment::Kernel,
    1,
    ErrorLevel::Fatal,
    "this code should not be called",
);
pub static ERR_NOT_RUNNING: ErrorDef =
    ErrorDef::new(ErrorSegment::Kernel, 2, ErrorLevel::Error, "object is not running");

// Temp
pub static ERR_TEMP: ErrorDef =
    ErrorDef::new(ErrorSegment::Temp, 1, ErrorLevel::Error, "temporary error");

/// A runtime error value.
///
/// Cheap to clone; equality compares code, message and debug tail, which is
/// what tests assert on.
#[derive(Clone)]
pub struct Error {
    def: &'static ErrorDef,
    message: Option<Cow<'static, str>>,
    debug: Option<String>,
}

impl Error {
    #[inline]
    pub fn new(def: &'static ErrorDef) -> Self {
        Self { def, message: None, debug: None }
    }

    /// A `Temp` error with a one-off message.
    pub fn temp(message: impl Into<Cow<'static, str>>) -> Self {
        Self { def: &ERR_TEMP, message: Some(message.into()), debug: None }
    }

    /// Override the definition's message for this value.
    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Append to the debug tail. Multiple appends are newline-separated.
    pub fn add_debug(&mut self, debug: &str) {
        match self.debug.as_mut() {
            Some(d) => {
                d.push('\n');
                d.push_str(debug);
            }
            None => self.debug = Some(debug.to_string()),
        }
    }

    /// Builder-style [`Error::add_debug`].
    pub fn with_debug(mut self, debug: &str) -> Self {
        self.add_debug(debug);
        self
    }

    #[inline]
    pub fn code(&self) -> u32 {
        self.def.code()
    }

    #[inline]
    pub fn segment(&self) -> ErrorSegment {
        self.def.segment
    }

    #[inline]
    pub fn level(&self) -> ErrorLevel {
        self.def.level
    }

    #[inline]
    pub fn message(&self) -> &str {
        match self.message.as_ref() {
            Some(m) => m,
            None => self.def.message,
        }
    }

    #[inline]
    pub fn debug(&self) -> Option<&str> {
        self.debug.as_deref()
    }
}

impl From<&'static ErrorDef> for Error {
    #[inline]
    fn from(def: &'static ErrorDef) -> Self {
        Error::new(def)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.code() == other.code()
            && self.message() == other.message()
            && self.debug == other.debug
    }
}

impl Eq for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}[{}] {}", self.level(), self.code(), self.message())?;
        if let Some(d) = self.debug.as_ref() {
            write!(f, "\n{}", d)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_layout() {
        assert_eq!(ERR_STREAM.code(), 1 << 16 | 1);
        assert_eq!(ERR_CONN_READ.code(), 2 << 16 | 2);
        assert_eq!(ERR_BIND.code(), 4 << 16 | 1);
    }

    #[test]
    fn test_add_debug_newline_separated() {
        let mut e = Error::new(&ERR_STREAM);
        e.add_debug("first");
        e.add_debug("second");
        assert_eq!(e.debug(), Some("first\nsecond"));
        let s = format!("{}", e);
        assert!(s.contains("bad stream"));
        assert!(s.ends_with("first\nsecond"));
    }

    #[test]
    fn test_temp_message_override() {
        let e = Error::temp("unsupported protocol xxx");
        assert_eq!(e.code(), ERR_TEMP.code());
        assert_eq!(e.message(), "unsupported protocol xxx");
    }

    #[test]
    fn test_eq_by_code_and_text() {
        assert_eq!(Error::new(&ERR_STREAM), Error::new(&ERR_STREAM));
        assert_ne!(Error::new(&ERR_STREAM), Error::new(&ERR_CONN_READ));
        assert_ne!(Error::new(&ERR_STREAM), Error::new(&ERR_STREAM).with_debug("x"));
    }
}

//! Reply status field.

use std::fmt;

/// The 8-byte status field of a reply, with surrounding spaces removed.
///
/// `OK` and `ERR` prefixes are recognized case-insensitively. Anything else
/// (`ATEOF`, `NOREC`, `LOCKED`, ...) is a function-specific status that the
/// caller interprets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StatusCode(String);

impl StatusCode {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into().trim().to_string())
    }

    /// Builds a status from raw header bytes.
    pub fn from_field(raw: &[u8]) -> Self {
        Self::new(String::from_utf8_lossy(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_ok(&self) -> bool {
        has_prefix(&self.0, "OK")
    }

    pub fn is_error(&self) -> bool {
        has_prefix(&self.0, "ERR")
    }

    /// The code following an `ERR` prefix, e.g. `"0042"` for `ERR0042`.
    pub fn error_code(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        let end = self.0.len().min(8);
        Some(self.0.get(3..end).unwrap_or("").trim())
    }
}

fn has_prefix(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StatusCode {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_status() {
        let status = StatusCode::from_field(b"OK      ");
        assert!(status.is_ok());
        assert!(!status.is_error());
        assert_eq!(status.as_str(), "OK");
        assert!(StatusCode::from("ok").is_ok());
    }

    #[test]
    fn test_error_code_extraction() {
        let status = StatusCode::from_field(b"ERR 0042");
        assert!(status.is_error());
        assert_eq!(status.error_code(), Some("0042"));

        let status = StatusCode::from("err12");
        assert_eq!(status.error_code(), Some("12"));

        assert_eq!(StatusCode::from("ERR").error_code(), Some(""));
        assert_eq!(StatusCode::from("OK").error_code(), None);
    }

    #[test]
    fn test_function_specific_status() {
        let status = StatusCode::from_field(b"ATEOF   ");
        assert!(!status.is_ok());
        assert!(!status.is_error());
        assert_eq!(status.to_string(), "ATEOF");
    }

    #[test]
    fn test_blank_status() {
        let status = StatusCode::from_field(b"        ");
        assert_eq!(status.as_str(), "");
        assert!(!status.is_ok());
    }
}

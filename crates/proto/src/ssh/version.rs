//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with a version exchange where both client and server
//! send an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification; the client skips
//! them. Every line is limited to 255 bytes.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::version::Version;
//!
//! let version = Version::new("Strand_0.1.0", Some("session transport"));
//! assert_eq!(version.to_string(), "SSH-2.0-Strand_0.1.0 session transport");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use bytes::BytesMut;
use strand_platform::{StrandError, StrandResult};

/// Longest identification line accepted, excluding CR LF.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of lines a client skips before the server identification.
pub const MAX_PRE_BANNER_LINES: usize = 50;

/// Identification line `SSH-<protocol>-<software>[ <comments>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    protocol: String,
    software: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an SSH-2.0 identification.
    ///
    /// # Example
    ///
    /// ```rust
    /// use strand_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Strand_0.1.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Strand_0.1.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            protocol: "2.0".to_string(),
            software: software.to_string(),
            comments: comments.map(str::to_string),
        }
    }

    /// Identification sent when none is configured.
    pub fn default_strand() -> Self {
        Self::new(&format!("Strand_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line, with or without the trailing CR LF.
    ///
    /// # Errors
    ///
    /// Returns [`StrandError::Protocol`] for lines over 255 bytes, lines
    /// holding NUL, lines without the `SSH-` prefix or a software part, and
    /// protocol versions other than `2.0` and `1.99`.
    pub fn parse(line: &str) -> StrandResult<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.len() > MAX_VERSION_LENGTH {
            return Err(StrandError::Protocol(format!(
                "Identification of {} bytes exceeds the {} byte limit",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(StrandError::Protocol("Identification holds a NUL byte".to_string()));
        }

        let body = line.strip_prefix("SSH-").ok_or_else(|| {
            StrandError::Protocol(format!("Identification lacks the SSH- prefix: {:?}", line))
        })?;
        let (protocol, rest) = match body.split_once('-') {
            Some((protocol, rest)) if !rest.is_empty() => (protocol, rest),
            _ => {
                return Err(StrandError::Protocol(format!(
                    "Identification has no software version: {:?}",
                    line
                )))
            }
        };
        if !matches!(protocol, "2.0" | "1.99") {
            return Err(StrandError::Protocol(format!(
                "Unsupported protocol version {} (only 2.0 and 1.99 are spoken)",
                protocol
            )));
        }

        let (software, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim().to_string())),
            None => (rest, None),
        };
        Ok(Self {
            protocol: protocol.to_string(),
            software: software.to_string(),
            comments,
        })
    }

    /// Protocol version, `2.0` or `1.99`.
    pub fn proto_version(&self) -> &str {
        &self.protocol
    }

    /// Software version.
    pub fn software(&self) -> &str {
        &self.software
    }

    /// Comments after the software version.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Line as sent on the wire, CR LF terminated.
    pub fn to_wire_format(&self) -> Vec<u8> {
        let mut line = self.to_string().into_bytes();
        line.extend_from_slice(b"\r\n");
        line
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SSH-")?;
        f.write_str(&self.protocol)?;
        f.write_str("-")?;
        f.write_str(&self.software)?;
        match &self.comments {
            Some(comments) => write!(f, " {}", comments),
            None => Ok(()),
        }
    }
}

/// Extracts the peer identification line from the start of a byte stream.
#[derive(Debug)]
pub struct IdentificationReader {
    allow_banner: bool,
    skipped: usize,
}

impl IdentificationReader {
    /// Creates a reader. Clients pass `allow_banner = true` to skip
    /// pre-identification lines sent by servers.
    pub fn new(allow_banner: bool) -> Self {
        Self {
            allow_banner,
            skipped: 0,
        }
    }

    /// Consumes complete lines from `buf` until the identification is found.
    ///
    /// Returns the identification line without CR LF, or `None` if more data
    /// is needed. Bytes after the identification stay in `buf`.
    pub fn poll(&mut self, buf: &mut BytesMut) -> StrandResult<Option<String>> {
        loop {
            let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
                if buf.len() > MAX_VERSION_LENGTH {
                    return Err(StrandError::Protocol(format!(
                        "Identification line exceeds {} bytes",
                        MAX_VERSION_LENGTH
                    )));
                }
                return Ok(None);
            };

            let raw = buf.split_to(pos + 1);
            let mut line = &raw[..pos];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.len() > MAX_VERSION_LENGTH {
                return Err(StrandError::Protocol(format!(
                    "Identification line exceeds {} bytes",
                    MAX_VERSION_LENGTH
                )));
            }

            if line.starts_with(b"SSH-") {
                let text = std::str::from_utf8(line).map_err(|_| {
                    StrandError::Protocol("Identification is not valid UTF-8".to_string())
                })?;
                return Ok(Some(text.to_string()));
            }

            if !self.allow_banner {
                return Err(StrandError::Protocol(
                    "Peer did not send an SSH identification".to_string(),
                ));
            }
            self.skipped += 1;
            if self.skipped > MAX_PRE_BANNER_LINES {
                return Err(StrandError::Protocol(format!(
                    "More than {} lines before identification",
                    MAX_PRE_BANNER_LINES
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("Strand_0.1.0", None);
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "Strand_0.1.0");
        assert_eq!(version.comments(), None);
    }

    #[test]
    fn test_version_display() {
        let version = Version::new("x", None);
        assert_eq!(version.to_string(), "SSH-2.0-x");

        let version_with_comments = Version::new("Strand_0.1.0", Some("build 7"));
        assert_eq!(version_with_comments.to_string(), "SSH-2.0-Strand_0.1.0 build 7");
        assert!(Version::default_strand().to_string().starts_with("SSH-2.0-Strand_"));
    }

    #[test]
    fn test_version_parse() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));

        assert_eq!(Version::parse("SSH-1.99-Legacy").unwrap().proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_invalid_prefix() {
        assert!(matches!(
            Version::parse("INVALID-2.0-Test"),
            Err(StrandError::Protocol(_))
        ));
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        match Version::parse("SSH-1.0-OldClient") {
            Err(StrandError::Protocol(msg)) => {
                assert!(msg.contains("Unsupported protocol version"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_version_parse_limits() {
        let long_string = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long_string).is_err());
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
        assert!(Version::parse("SSH-2.0-").is_err());
    }

    #[test]
    fn test_version_wire_format() {
        let version = Version::new("y", None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-y\r\n");
    }

    #[test]
    fn test_reader_skips_banner_lines() {
        let mut reader = IdentificationReader::new(true);
        let mut buf = BytesMut::from(&b"Welcome\r\nto the host\nSSH-2.0-y\r\n\x00\x00"[..]);
        assert_eq!(reader.poll(&mut buf).unwrap().as_deref(), Some("SSH-2.0-y"));
        assert_eq!(&buf[..], &[0, 0]);
    }

    #[test]
    fn test_reader_waits_for_full_line() {
        let mut reader = IdentificationReader::new(false);
        let mut buf = BytesMut::from(&b"SSH-2.0-"[..]);
        assert!(reader.poll(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"x\r\n");
        assert_eq!(reader.poll(&mut buf).unwrap().as_deref(), Some("SSH-2.0-x"));
    }

    #[test]
    fn test_reader_rejects_banner_on_server() {
        let mut reader = IdentificationReader::new(false);
        let mut buf = BytesMut::from(&b"hello\r\n"[..]);
        assert!(reader.poll(&mut buf).is_err());
    }

    #[test]
    fn test_reader_rejects_long_line() {
        let mut reader = IdentificationReader::new(true);
        let mut buf = BytesMut::from(vec![b'a'; 300].as_slice());
        assert!(reader.poll(&mut buf).is_err());
    }
}

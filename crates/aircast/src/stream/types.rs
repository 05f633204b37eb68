//! Stream-side data types
//!
//! Recognized audio container hints, proxy configuration, `Range:` header
//! round-tripping, and the events a byte source delivers to the engine.

use std::collections::HashMap;
use std::fmt;

/// Recognized audio container/framing hints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFileType {
    Mp3,
    Wav,
    Aiff,
    M4a,
    Mpeg4,
    Caf,
    AacAdts,
}

impl fmt::Display for AudioFileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFileType::Mp3 => "mp3",
            AudioFileType::Wav => "wav",
            AudioFileType::Aiff => "aiff",
            AudioFileType::M4a => "m4a",
            AudioFileType::Mpeg4 => "mp4",
            AudioFileType::Caf => "caf",
            AudioFileType::AacAdts => "aac",
        };
        write!(f, "{}", name)
    }
}

impl AudioFileType {
    /// Derive a file type from a MIME string (case-insensitive, tolerates
    /// `; charset=...` style parameters). Returns None when unrecognized.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_lowercase();
        match essence.as_str() {
            "audio/mpeg" | "audio/mp3" => Some(AudioFileType::Mp3),
            "audio/x-wav" => Some(AudioFileType::Wav),
            "audio/x-aiff" => Some(AudioFileType::Aiff),
            "audio/x-m4a" => Some(AudioFileType::M4a),
            "audio/mp4" => Some(AudioFileType::Mpeg4),
            "audio/x-caf" => Some(AudioFileType::Caf),
            "audio/aac" | "audio/aacp" => Some(AudioFileType::AacAdts),
            _ => None,
        }
    }

    /// Derive a file type from a URL's extension, ignoring any query string.
    pub fn from_url(url: &str) -> Option<Self> {
        let lower = url.to_lowercase();
        let path = lower.split('?').next().unwrap_or(&lower);
        let ext = path.rsplit('.').next()?;
        match ext {
            "mp3" => Some(AudioFileType::Mp3),
            "wav" => Some(AudioFileType::Wav),
            "aifc" | "aiff" => Some(AudioFileType::Aiff),
            "m4a" => Some(AudioFileType::M4a),
            "mp4" => Some(AudioFileType::Mpeg4),
            "caf" => Some(AudioFileType::Caf),
            "aac" => Some(AudioFileType::AacAdts),
            _ => None,
        }
    }

    /// Full derivation chain: Content-Type header, then URL extension.
    /// Returns `(type, defaulted)` where `defaulted` is true when neither
    /// source matched and MP3 was assumed.
    pub fn derive(content_type: Option<&str>, url: &str) -> (Self, bool) {
        if let Some(t) = content_type.and_then(Self::from_mime) {
            return (t, false);
        }
        if let Some(t) = Self::from_url(url) {
            return (t, false);
        }
        (AudioFileType::Mp3, true)
    }
}

/// Proxy selection for the byte source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    /// Consult OS/environment proxy settings (reqwest default behavior)
    System,
    /// Explicit HTTP proxy (HTTPS variant applied for https URLs)
    Http,
    /// Explicit SOCKS5 proxy
    Socks,
}

/// Proxy configuration for the byte source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

/// Format a `Range:` header value for a resume/seek request.
///
/// The end is inclusive per RFC 7233: `bytes=S-(file_length - 1)`.
pub fn format_range_header(seek_byte_offset: u64, file_length: u64) -> String {
    format!("bytes={}-{}", seek_byte_offset, file_length.saturating_sub(1))
}

/// Parse a `Range:` header value back into `(seek_byte_offset, file_length)`.
///
/// Inverse of [`format_range_header`]; returns None for anything that does
/// not match the single-range `bytes=S-E` shape.
pub fn parse_range_header(value: &str) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().ok()?;
    Some((start, end + 1))
}

/// Events a byte source delivers to the engine
#[derive(Debug)]
pub enum SourceEvent {
    /// The HTTP response arrived; carries the response header map and the
    /// values the engine cares about directly
    Opened {
        headers: HashMap<String, String>,
        content_length: Option<u64>,
        content_type: Option<String>,
    },
    /// A chunk of body bytes
    Bytes(Vec<u8>),
    /// Clean end of the response body
    End,
    /// Transport-level failure, with the underlying error's description
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- AudioFileType::from_mime ---

    #[test]
    fn mime_mpeg_is_mp3() {
        assert_eq!(AudioFileType::from_mime("audio/mpeg"), Some(AudioFileType::Mp3));
    }

    #[test]
    fn mime_table_matches() {
        assert_eq!(AudioFileType::from_mime("audio/x-wav"), Some(AudioFileType::Wav));
        assert_eq!(AudioFileType::from_mime("audio/x-aiff"), Some(AudioFileType::Aiff));
        assert_eq!(AudioFileType::from_mime("audio/x-m4a"), Some(AudioFileType::M4a));
        assert_eq!(AudioFileType::from_mime("audio/mp4"), Some(AudioFileType::Mpeg4));
        assert_eq!(AudioFileType::from_mime("audio/x-caf"), Some(AudioFileType::Caf));
        assert_eq!(AudioFileType::from_mime("audio/aac"), Some(AudioFileType::AacAdts));
        assert_eq!(AudioFileType::from_mime("audio/aacp"), Some(AudioFileType::AacAdts));
    }

    #[test]
    fn mime_case_insensitive() {
        assert_eq!(AudioFileType::from_mime("Audio/MPEG"), Some(AudioFileType::Mp3));
    }

    #[test]
    fn mime_with_charset_parameter() {
        assert_eq!(
            AudioFileType::from_mime("audio/mpeg; charset=utf-8"),
            Some(AudioFileType::Mp3)
        );
    }

    #[test]
    fn mime_unknown_is_none() {
        assert_eq!(AudioFileType::from_mime("application/octet-stream"), None);
        assert_eq!(AudioFileType::from_mime(""), None);
    }

    // --- AudioFileType::from_url ---

    #[test]
    fn url_extension_table_matches() {
        assert_eq!(
            AudioFileType::from_url("http://example.com/a.mp3"),
            Some(AudioFileType::Mp3)
        );
        assert_eq!(
            AudioFileType::from_url("http://example.com/a.wav"),
            Some(AudioFileType::Wav)
        );
        assert_eq!(
            AudioFileType::from_url("http://example.com/a.aifc"),
            Some(AudioFileType::Aiff)
        );
        assert_eq!(
            AudioFileType::from_url("http://example.com/a.aiff"),
            Some(AudioFileType::Aiff)
        );
        assert_eq!(
            AudioFileType::from_url("http://example.com/a.m4a"),
            Some(AudioFileType::M4a)
        );
        assert_eq!(
            AudioFileType::from_url("http://example.com/a.mp4"),
            Some(AudioFileType::Mpeg4)
        );
        assert_eq!(
            AudioFileType::from_url("http://example.com/a.caf"),
            Some(AudioFileType::Caf)
        );
        assert_eq!(
            AudioFileType::from_url("http://example.com/a.aac"),
            Some(AudioFileType::AacAdts)
        );
    }

    #[test]
    fn url_with_query_string() {
        assert_eq!(
            AudioFileType::from_url("http://example.com/stream.mp3?sid=1&q=hi"),
            Some(AudioFileType::Mp3)
        );
    }

    #[test]
    fn url_case_insensitive() {
        assert_eq!(
            AudioFileType::from_url("http://example.com/TRACK.MP3"),
            Some(AudioFileType::Mp3)
        );
    }

    #[test]
    fn url_without_recognized_extension() {
        assert_eq!(AudioFileType::from_url("http://example.com/stream"), None);
        assert_eq!(AudioFileType::from_url("http://example.com/a.ogg"), None);
    }

    // --- derive chain ---

    #[test]
    fn derive_prefers_content_type_over_url() {
        let (t, defaulted) = AudioFileType::derive(Some("audio/aac"), "http://x/a.mp3");
        assert_eq!(t, AudioFileType::AacAdts);
        assert!(!defaulted);
    }

    #[test]
    fn derive_falls_back_to_url() {
        let (t, defaulted) =
            AudioFileType::derive(Some("application/octet-stream"), "http://x/a.wav");
        assert_eq!(t, AudioFileType::Wav);
        assert!(!defaulted);
    }

    #[test]
    fn derive_defaults_to_mp3() {
        let (t, defaulted) = AudioFileType::derive(None, "http://x/stream");
        assert_eq!(t, AudioFileType::Mp3);
        assert!(defaulted);
    }

    // --- Range header round-trip ---

    #[test]
    fn range_header_format() {
        assert_eq!(format_range_header(0, 1000), "bytes=0-999");
        assert_eq!(format_range_header(481_000, 1_000_000), "bytes=481000-999999");
    }

    #[test]
    fn range_header_round_trip() {
        for (offset, len) in [(0u64, 1u64), (1, 2), (481_000, 1_000_000), (999_999, 1_000_000)] {
            let header = format_range_header(offset, len);
            assert_eq!(
                parse_range_header(&header),
                Some((offset, len)),
                "round-trip failed for {}..{}",
                offset,
                len
            );
        }
    }

    #[test]
    fn range_header_parse_rejects_garbage() {
        assert_eq!(parse_range_header("bytes=abc-def"), None);
        assert_eq!(parse_range_header("items=0-10"), None);
        assert_eq!(parse_range_header("bytes=10"), None);
        assert_eq!(parse_range_header(""), None);
    }

    // --- Display ---

    #[test]
    fn file_type_display() {
        assert_eq!(AudioFileType::Mp3.to_string(), "mp3");
        assert_eq!(AudioFileType::AacAdts.to_string(), "aac");
        assert_eq!(AudioFileType::Mpeg4.to_string(), "mp4");
    }
}

//! Stream handling
//!
//! Network side of the engine: the HTTP(S) byte source with proxy and
//! `Range:` support, the Shoutcast inline content-type sniffer, and the
//! stream-side data types (file-type hints, proxy config, source events).

pub mod sniffer;
pub mod source;
pub mod types;

pub use sniffer::{ShoutcastSniffer, SniffResult};
pub use source::{ByteSource, ByteSourceRequest};
pub use types::{
    format_range_header, parse_range_header, AudioFileType, ProxyConfig, ProxyKind, SourceEvent,
};

//! Configuration constants for the aircast engine

/// Output buffer pool configuration
pub mod pool {
    /// Default number of output buffers rotated through the audio queue
    pub const DEFAULT_BUFFER_COUNT: usize = 16;

    /// Default capacity of one output buffer in bytes (also the fallback
    /// packet size bound when the parser reports none)
    pub const DEFAULT_BUFFER_SIZE: usize = 2048;

    /// Maximum packet descriptors recorded per buffer (VBR)
    pub const MAX_PACKET_DESCS: usize = 512;
}

/// Network-related configuration
pub mod network {
    /// User agent for HTTP requests
    pub const USER_AGENT: &str = concat!("aircast/", env!("CARGO_PKG_VERSION"));

    /// Connection timeout in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Minimum network read chunk size in bytes; the effective chunk is
    /// max(packet_buffer_size, this)
    pub const MIN_CHUNK_SIZE: usize = 2048;

    /// Chunks handled per engine wakeup, and the source channel bound.
    /// Bounds stack use per iteration and lets other events interleave.
    pub const CHUNKS_PER_WAKEUP: usize = 3;
}

/// Timeout configuration
pub mod timeouts {
    /// Default watchdog interval: the stream fails with TimedOut when no
    /// network events arrive within one interval
    pub const DEFAULT_TIMEOUT_INTERVAL_SECS: u64 = 10;

    /// Engine status-snapshot refresh cadence in milliseconds
    pub const STATUS_TICK_MS: u64 = 500;
}

/// Bitrate and duration estimation
pub mod bitrate {
    /// Packets processed before a VBR bitrate estimate is considered usable
    pub const BITRATE_EST_MIN_PACKETS: u64 = 50;

    /// Initial upper bound of the total-packet bisection; doubles as the
    /// "count unknowable" sentinel when the parser never rejects a seek
    pub const PACKET_DISCOVERY_UPPER: u64 = 1_000_000;

    /// Buffers' worth of trailer room left when capping a seek offset
    pub const SEEK_TRAILER_BUFFERS: u64 = 2;
}

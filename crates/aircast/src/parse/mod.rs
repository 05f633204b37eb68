//! Format parser contract
//!
//! The container/codec parser is an external collaborator; the engine only
//! depends on the event stream it produces while consuming raw bytes, plus
//! a handful of queryable properties. A real implementation wraps a
//! platform or library parser; tests script one.

use crate::error::Result;
use crate::stream::types::AudioFileType;

/// Audio stream basic description: the fixed per-stream format parameters.
///
/// `bytes_per_packet == 0` means variable bit rate: every packet arrives
/// with its own [`PacketDescription`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Asbd {
    pub sample_rate: f64,
    pub format_id: u32,
    pub frames_per_packet: u32,
    pub bytes_per_packet: u32,
    pub channels: u32,
}

impl Asbd {
    /// Wall-clock duration of one packet in seconds, 0.0 when unknown
    pub fn packet_duration(&self) -> f64 {
        if self.sample_rate > 0.0 {
            f64::from(self.frames_per_packet) / self.sample_rate
        } else {
            0.0
        }
    }

    /// True iff packets carry per-packet descriptions
    pub fn is_vbr(&self) -> bool {
        self.bytes_per_packet == 0
    }
}

/// Placement of one encoded packet within a byte run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescription {
    /// Offset of the packet's first byte within the run it was delivered
    /// in (rewritten to the output-buffer offset when staged for submit)
    pub start_offset: i64,
    pub byte_size: u32,
    /// Frames in this packet when it deviates from `frames_per_packet`
    pub variable_frames: u32,
}

/// Events emitted by a parser while it consumes bytes
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// Byte offset within the resource where audio frames begin
    DataOffset(u64),
    /// Total audio payload length in bytes
    AudioDataByteCount(u64),
    /// The stream's format was discovered
    DataFormat(Asbd),
    /// Multiple candidate formats (layered/HE streams); the engine picks one
    FormatList(Vec<Asbd>),
    /// Framing is understood; packets will follow
    ReadyToProducePackets,
    /// Encoded packets. `descriptions` is present iff the stream is VBR;
    /// a CBR stream delivers a raw byte run.
    Packets {
        data: Vec<u8>,
        descriptions: Option<Vec<PacketDescription>>,
    },
}

/// Incremental container/codec parser.
///
/// Byte-order contract: `parse_bytes` receives the resource's bytes in
/// network arrival order, and packets inside the returned events are in
/// emission order.
pub trait AudioFileParser: Send {
    /// Consume raw bytes, returning the resulting events in order.
    /// `discontinuous` marks the first feed after a byte-aligned jump.
    fn parse_bytes(&mut self, data: &[u8], discontinuous: bool) -> Result<Vec<ParserEvent>>;

    /// Parser's upper bound on one packet's encoded size, if it has one
    fn packet_size_upper_bound(&self) -> Option<u32>;

    /// Largest packet actually observed, if tracked
    fn maximum_packet_size(&self) -> Option<u32>;

    /// Total audio packet count when the container declares it
    fn audio_data_packet_count(&self) -> Option<u64>;

    /// Codec configuration blob some formats require; failures to fetch
    /// are represented as None and are not errors
    fn magic_cookie(&self) -> Option<Vec<u8>>;

    /// Reposition the parser to the given packet, returning the byte
    /// offset of that packet relative to the start of audio data. Fails
    /// for packets beyond the end of the stream (when the end is known).
    fn seek_to_packet(&mut self, packet: u64) -> Result<u64>;
}

/// Opens parsers for a given file type; reopened after a sniffer reset.
pub trait ParserFactory: Send {
    fn open(&mut self, file_type: AudioFileType) -> Result<Box<dyn AudioFileParser>>;
}

impl<F> ParserFactory for F
where
    F: FnMut(AudioFileType) -> Result<Box<dyn AudioFileParser>> + Send,
{
    fn open(&mut self, file_type: AudioFileType) -> Result<Box<dyn AudioFileParser>> {
        self(file_type)
    }
}

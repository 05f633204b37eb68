//! Aircast — Network Audio Streaming Engine
//!
//! Downloads a remote audio resource over HTTP(S), incrementally parses
//! container/codec framing as bytes arrive, assembles encoded packets into a
//! bounded pool of output buffers, and feeds those buffers to a platform
//! audio output queue, with pause, resume, seek, timeouts, and bitrate
//! estimation.
//!
//! ## Quick start
//!
//! ```no_run
//! use aircast::Streamer;
//!
//! let streamer = Streamer::new("https://example.com/track.mp3");
//! // install a parser factory and an audio queue factory, then:
//! streamer.start();
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod parse;
pub mod stream;
pub mod streamer;

pub use error::{Result, StreamError};
pub use events::{EventBus, StreamerEvent};
pub use streamer::{DoneReason, State, StatusSnapshot, Streamer};

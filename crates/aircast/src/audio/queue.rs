//! Platform audio queue interface
//!
//! The output queue (buffer submission, mixing, playback clock) is an
//! external collaborator. The engine drives it through this trait and
//! receives its callbacks as [`QueueEvent`]s on the engine channel, which
//! is how callbacks from the platform's worker threads are marshalled onto
//! the single engine thread.

use std::time::Duration;

use crossbeam_channel::Sender;

use crate::error::Result;
use crate::parse::{Asbd, PacketDescription};

/// Callbacks from the platform queue, marshalled to the engine thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// The queue finished consuming the buffer at this pool index
    BufferComplete(usize),
    /// The queue's running state changed
    IsRunning(bool),
}

/// A live platform output queue.
///
/// Buffers are identified by pool index; the implementation owns whatever
/// platform handles back them. Between `enqueue_buffer` and the matching
/// `BufferComplete` event the buffer's contents belong to the queue.
pub trait AudioQueue: Send {
    /// Allocate `count` buffers of `capacity` bytes each.
    fn allocate_buffers(&mut self, count: usize, capacity: usize) -> Result<()>;

    /// Submit a filled buffer. `descriptions` is empty for CBR streams.
    fn enqueue_buffer(
        &mut self,
        index: usize,
        data: &[u8],
        descriptions: &[PacketDescription],
    ) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Stop playback. `immediate` stops now and discards queued audio;
    /// otherwise the queue drains what it holds first. Either way an
    /// `IsRunning(false)` event follows. An immediate stop must deliver
    /// its `BufferComplete` and `IsRunning(false)` events before
    /// returning, so the caller can consume them under its seek guard.
    fn stop(&mut self, immediate: bool) -> Result<()>;

    /// Asynchronously play out everything enqueued so far; used at end of
    /// stream so the tail is not cut off.
    fn flush(&mut self) -> Result<()>;

    /// Discard queued audio without stopping (sniffer reset path).
    fn reset(&mut self) -> Result<()>;

    /// Install codec configuration bytes some formats require.
    fn set_magic_cookie(&mut self, cookie: &[u8]) -> Result<()>;

    /// Set playback volume, 0.0..=1.0.
    fn set_volume(&mut self, volume: f32) -> Result<()>;

    /// Ramp volume to `volume` over `duration`.
    fn fade_to(&mut self, volume: f32, duration: Duration) -> Result<()>;

    /// Configure time-pitch processing. `bypass` disables it (unity rate
    /// or unknown stream length); otherwise `rate` applies.
    fn set_playback_rate(&mut self, rate: f32, bypass: bool) -> Result<()>;

    /// Current playback position in sample frames since the queue started.
    /// Can briefly be negative right after a restart.
    fn sample_time(&self) -> Result<f64>;
}

/// Creates output queues for a discovered stream format.
///
/// The factory registers the `events` sender with the queue it creates so
/// buffer-complete and is-running callbacks arrive on the engine channel;
/// a registration failure surfaces as `AudioQueueAddListenerFailed`.
pub trait AudioQueueFactory: Send {
    fn create(&mut self, asbd: &Asbd, events: Sender<QueueEvent>) -> Result<Box<dyn AudioQueue>>;
}

impl<F> AudioQueueFactory for F
where
    F: FnMut(&Asbd, Sender<QueueEvent>) -> Result<Box<dyn AudioQueue>> + Send,
{
    fn create(&mut self, asbd: &Asbd, events: Sender<QueueEvent>) -> Result<Box<dyn AudioQueue>> {
        self(asbd, events)
    }
}

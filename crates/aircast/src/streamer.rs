//! The streamer engine
//!
//! One `Streamer` per URL. A dedicated engine thread owns every piece of
//! mutable state and is driven by crossbeam channels: user commands, byte
//! source events, audio queue callbacks, and periodic ticks. The public
//! handle sends commands with reply channels and reads a shared status
//! snapshot, so no caller ever touches engine state directly.
//!
//! Data flow: byte source → (sniffer) → parser → VBR/CBR packet handlers →
//! buffer pool → audio queue. When every output buffer is rented out,
//! incoming packets detour into the overflow FIFO and the byte source is
//! unscheduled; a buffer-complete callback drains the FIFO and reschedules
//! the source.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, select, tick, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::audio::{
    estimate_duration, AudioQueue, AudioQueueFactory, BitrateEstimator, BufferPool, PacketFifo,
    QueueEvent, QueuedPacket,
};
use crate::config::bitrate::{PACKET_DISCOVERY_UPPER, SEEK_TRAILER_BUFFERS};
use crate::config::network::{CHUNKS_PER_WAKEUP, MIN_CHUNK_SIZE};
use crate::config::pool::{DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE};
use crate::config::timeouts::{DEFAULT_TIMEOUT_INTERVAL_SECS, STATUS_TICK_MS};
use crate::error::StreamError;
use crate::events::{EventBus, StreamerEvent};
use crate::parse::{Asbd, AudioFileParser, PacketDescription, ParserEvent, ParserFactory};
use crate::stream::{
    AudioFileType, ByteSource, ByteSourceRequest, ProxyConfig, ProxyKind, ShoutcastSniffer,
    SourceEvent,
};

/// Lifecycle states of a streamer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Initialized,
    WaitingForData,
    WaitingForQueueToStart,
    Playing,
    Paused,
    Stopped,
    Done,
}

impl State {
    /// Terminal states accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Stopped | State::Done)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Initialized => "Initialized",
            State::WaitingForData => "WaitingForData",
            State::WaitingForQueueToStart => "WaitingForQueueToStart",
            State::Playing => "Playing",
            State::Paused => "Paused",
            State::Stopped => "Stopped",
            State::Done => "Done",
        };
        write!(f, "{}", name)
    }
}

/// Why a streamer reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// `stop()` was called
    Stopped,
    /// The stream played to its end
    Eof,
    /// The stream failed; the error is in the status snapshot
    Error,
}

/// Read-only view of the engine, refreshed after every processed message
/// and on the periodic status tick
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub state: State,
    pub error: Option<StreamError>,
    /// Playback position in seconds; None before `start()`
    pub progress: Option<f64>,
    /// Estimated total duration in seconds, when estimable
    pub duration: Option<f64>,
    /// Estimated bitrate in bits/sec, when estimable
    pub bit_rate: Option<f64>,
    pub buffers_used: usize,
    pub events_since_last_tick: u32,
    /// Response headers from the most recent connection
    pub response_headers: HashMap<String, String>,
}

type SharedStatus = Arc<Mutex<StatusSnapshot>>;

/// Pre-start configuration updates
enum ConfigUpdate {
    BufferCount(usize),
    BufferSize(usize),
    TimeoutInterval(Duration),
    PlaybackRate(f32),
    BufferInfinite(bool),
    FileType(AudioFileType),
}

/// Commands sent from the handle to the engine thread
enum Command {
    Configure(ConfigUpdate, Sender<bool>),
    SetParserFactory(Box<dyn ParserFactory>, Sender<bool>),
    SetQueueFactory(Box<dyn AudioQueueFactory>, Sender<bool>),
    SetProxy(ProxyConfig),
    Start(Sender<bool>),
    Pause(Sender<bool>),
    Play(Sender<bool>),
    Stop(Sender<()>),
    SeekToTime(f64, Sender<bool>),
    SetVolume(f32, Sender<bool>),
    FadeTo(f32, Duration),
    Shutdown,
}

/// Network audio streamer, one per URL.
///
/// Construct with [`Streamer::new`], install the parser and audio queue
/// collaborators, optionally adjust configuration, then [`Streamer::start`].
pub struct Streamer {
    cmd_tx: Sender<Command>,
    status: SharedStatus,
    bus: Arc<EventBus>,
    thread: Option<JoinHandle<()>>,
}

impl Streamer {
    /// Create a streamer for `url`, spawning the engine thread.
    pub fn new(url: impl Into<String>) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let status: SharedStatus = Arc::new(Mutex::new(StatusSnapshot::default()));
        let bus = Arc::new(EventBus::new());
        let url = url.into();

        let thread_status = status.clone();
        let thread_bus = bus.clone();
        let thread = thread::Builder::new()
            .name("aircast-engine".to_string())
            .spawn(move || {
                Engine::new(url, thread_status, thread_bus).run(cmd_rx);
            })
            .ok();

        Self {
            cmd_tx,
            status,
            bus,
            thread,
        }
    }

    fn request_bool(&self, make: impl FnOnce(Sender<bool>) -> Command) -> bool {
        let (tx, rx) = bounded(1);
        if self.cmd_tx.send(make(tx)).is_err() {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    /// Subscribe to `StatusChanged` / `BitrateReady` notifications.
    pub fn subscribe(&self) -> Receiver<StreamerEvent> {
        self.bus.subscribe()
    }

    /// Current status snapshot.
    pub fn status(&self) -> StatusSnapshot {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    // --- collaborators (before start) ---

    /// Install the format parser factory. Returns false once started.
    pub fn set_parser_factory(&self, factory: impl ParserFactory + 'static) -> bool {
        self.request_bool(|tx| Command::SetParserFactory(Box::new(factory), tx))
    }

    /// Install the audio queue factory. Returns false once started.
    pub fn set_queue_factory(&self, factory: impl AudioQueueFactory + 'static) -> bool {
        self.request_bool(|tx| Command::SetQueueFactory(Box::new(factory), tx))
    }

    // --- proxies ---

    pub fn set_http_proxy(&self, host: impl Into<String>, port: u16) {
        let _ = self.cmd_tx.send(Command::SetProxy(ProxyConfig {
            kind: ProxyKind::Http,
            host: host.into(),
            port,
        }));
    }

    pub fn set_socks_proxy(&self, host: impl Into<String>, port: u16) {
        let _ = self.cmd_tx.send(Command::SetProxy(ProxyConfig {
            kind: ProxyKind::Socks,
            host: host.into(),
            port,
        }));
    }

    // --- configuration (before start) ---

    pub fn set_buffer_count(&self, count: usize) -> bool {
        count > 0 && self.request_bool(|tx| Command::Configure(ConfigUpdate::BufferCount(count), tx))
    }

    pub fn set_buffer_size(&self, size: usize) -> bool {
        size > 0 && self.request_bool(|tx| Command::Configure(ConfigUpdate::BufferSize(size), tx))
    }

    pub fn set_timeout_interval(&self, interval: Duration) -> bool {
        !interval.is_zero()
            && self.request_bool(|tx| Command::Configure(ConfigUpdate::TimeoutInterval(interval), tx))
    }

    pub fn set_playback_rate(&self, rate: f32) -> bool {
        rate > 0.0 && self.request_bool(|tx| Command::Configure(ConfigUpdate::PlaybackRate(rate), tx))
    }

    /// When set, the byte source is never unscheduled on backpressure.
    pub fn set_buffer_infinite(&self, infinite: bool) -> bool {
        self.request_bool(|tx| Command::Configure(ConfigUpdate::BufferInfinite(infinite), tx))
    }

    /// Force a file type instead of deriving it from the response/URL.
    pub fn set_file_type_hint(&self, file_type: AudioFileType) -> bool {
        self.request_bool(|tx| Command::Configure(ConfigUpdate::FileType(file_type), tx))
    }

    // --- playback control ---

    /// Open the byte source and begin streaming. False if already started.
    pub fn start(&self) -> bool {
        self.request_bool(Command::Start)
    }

    /// Pause playback. False unless currently `Playing`.
    pub fn pause(&self) -> bool {
        self.request_bool(Command::Pause)
    }

    /// Resume playback. False unless currently `Paused`.
    pub fn play(&self) -> bool {
        self.request_bool(Command::Play)
    }

    /// Stop the stream and release every resource. Idempotent; returns
    /// once teardown has completed.
    pub fn stop(&self) {
        let (tx, rx) = bounded(1);
        if self.cmd_tx.send(Command::Stop(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Seek to an absolute position in seconds. False when the stream's
    /// bitrate or duration is not yet known.
    pub fn seek_to_time(&self, seconds: f64) -> bool {
        self.request_bool(|tx| Command::SeekToTime(seconds, tx))
    }

    /// Seek relative to the current position.
    pub fn seek_by_delta(&self, delta: f64) -> bool {
        match self.progress() {
            Some(p) => self.seek_to_time((p + delta).max(0.0)),
            None => false,
        }
    }

    // --- volume ---

    /// Set playback volume in `[0, 1]`. False while no queue exists yet.
    pub fn set_volume(&self, volume: f32) -> bool {
        self.request_bool(|tx| Command::SetVolume(volume, tx))
    }

    pub fn fade_to(&self, volume: f32, duration: Duration) {
        let _ = self.cmd_tx.send(Command::FadeTo(volume, duration));
    }

    pub fn fade_in(&self, duration: Duration) {
        self.fade_to(1.0, duration);
    }

    pub fn fade_out(&self, duration: Duration) {
        self.fade_to(0.0, duration);
    }

    // --- observation ---

    /// Playback position in seconds.
    pub fn progress(&self) -> Option<f64> {
        self.status().progress
    }

    /// Estimated total duration in seconds.
    pub fn duration(&self) -> Option<f64> {
        self.status().duration
    }

    /// Estimated bitrate in bits/sec; available from the first
    /// `BitrateReady` notification onwards.
    pub fn calculated_bit_rate(&self) -> Option<f64> {
        self.status().bit_rate
    }

    pub fn current_state(&self) -> State {
        self.status().state
    }

    pub fn is_playing(&self) -> bool {
        self.current_state() == State::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.current_state() == State::Paused
    }

    pub fn is_waiting(&self) -> bool {
        matches!(
            self.current_state(),
            State::WaitingForData | State::WaitingForQueueToStart
        )
    }

    pub fn is_done(&self) -> bool {
        self.current_state().is_terminal()
    }

    /// Why the stream ended; None while it has not.
    pub fn done_reason(&self) -> Option<DoneReason> {
        let status = self.status();
        match status.state {
            State::Stopped => Some(DoneReason::Stopped),
            State::Done if status.error.is_some() => Some(DoneReason::Error),
            State::Done => Some(DoneReason::Eof),
            _ => None,
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Engine configuration, frozen at `start()`
struct EngineConfig {
    buffer_count: usize,
    buffer_size: usize,
    timeout_interval: Duration,
    playback_rate: f32,
    buffer_infinite: bool,
    file_type_hint: Option<AudioFileType>,
    proxy: Option<ProxyConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout_interval: Duration::from_secs(DEFAULT_TIMEOUT_INTERVAL_SECS),
            playback_rate: 1.0,
            buffer_infinite: false,
            file_type_hint: None,
            proxy: None,
        }
    }
}

/// Verdict of one packet-handler call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Feed {
    /// Keep feeding
    Continue,
    /// A buffer filled and the pool is now exhausted; `consumed` tells
    /// whether the triggering packet made it into the buffer
    Stop { consumed: bool },
    /// The stream failed
    Failed,
}

/// Outcome of feeding one parked FIFO node
enum NodeOutcome {
    Consumed,
    /// Pool exhausted again; the unconsumed tail, if any, goes back to
    /// the FIFO head
    Blocked(Option<QueuedPacket>),
    Failed,
}

/// The engine: owns all mutable state, runs on its own thread.
struct Engine {
    url: String,
    cfg: EngineConfig,
    parser_factory: Option<Box<dyn ParserFactory>>,
    queue_factory: Option<Box<dyn AudioQueueFactory>>,

    state: State,
    error: Option<StreamError>,
    started: bool,
    shutdown: bool,

    source: Option<ByteSource>,
    source_rx: Option<Receiver<SourceEvent>>,
    source_eof: bool,
    /// False while the source is unscheduled (its channel left unpolled)
    scheduled: bool,

    sniffer: Option<ShoutcastSniffer>,
    file_type: AudioFileType,

    parser: Option<Box<dyn AudioFileParser>>,
    discontinuous: bool,

    headers: HashMap<String, String>,
    data_offset: u64,
    audio_data_byte_count: u64,
    file_length: u64,
    asbd: Option<Asbd>,
    packet_buffer_size: usize,
    discovered_packets: Option<u64>,

    queue: Option<Box<dyn AudioQueue>>,
    queue_tx: Sender<QueueEvent>,
    queue_rx: Receiver<QueueEvent>,
    queue_started: bool,

    pool: Option<BufferPool>,
    fifo: PacketFifo,
    waiting_on_buffer: bool,

    /// Watchdog history: set when the source is unscheduled / rescheduled,
    /// cleared together by the tick that observes both
    wd_unscheduled: bool,
    wd_rescheduled: bool,
    events_since_last_tick: u32,
    watchdog: Option<Receiver<Instant>>,

    bitrate: BitrateEstimator,

    seek_byte_offset: u64,
    seek_time: f64,
    seeking: bool,
    last_progress: f64,

    status: SharedStatus,
    bus: Arc<EventBus>,
}

impl Engine {
    fn new(url: String, status: SharedStatus, bus: Arc<EventBus>) -> Self {
        let (queue_tx, queue_rx) = unbounded();
        Self {
            url,
            cfg: EngineConfig::default(),
            parser_factory: None,
            queue_factory: None,
            state: State::Initialized,
            error: None,
            started: false,
            shutdown: false,
            source: None,
            source_rx: None,
            source_eof: false,
            scheduled: false,
            sniffer: None,
            file_type: AudioFileType::Mp3,
            parser: None,
            discontinuous: false,
            headers: HashMap::new(),
            data_offset: 0,
            audio_data_byte_count: 0,
            file_length: 0,
            asbd: None,
            packet_buffer_size: 0,
            discovered_packets: None,
            queue: None,
            queue_tx,
            queue_rx,
            queue_started: false,
            pool: None,
            fifo: PacketFifo::new(),
            waiting_on_buffer: false,
            wd_unscheduled: false,
            wd_rescheduled: false,
            events_since_last_tick: 0,
            watchdog: None,
            bitrate: BitrateEstimator::new(),
            seek_byte_offset: 0,
            seek_time: 0.0,
            seeking: false,
            last_progress: 0.0,
            status,
            bus,
        }
    }

    fn run(mut self, cmd_rx: Receiver<Command>) {
        let status_tick = tick(Duration::from_millis(STATUS_TICK_MS));
        let never_source: Receiver<SourceEvent> = never();
        let never_instant: Receiver<Instant> = never();
        let queue_rx = self.queue_rx.clone();

        self.publish_status();

        loop {
            let source_rx = match (&self.source_rx, self.scheduled) {
                (Some(rx), true) => rx.clone(),
                _ => never_source.clone(),
            };
            let watchdog_rx = self.watchdog.clone().unwrap_or_else(|| never_instant.clone());

            select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(cmd) => self.handle_command(cmd),
                    Err(_) => break,
                },
                recv(source_rx) -> event => match event {
                    Ok(event) => {
                        self.handle_source_event(event);
                        self.drain_source_chunks();
                    }
                    Err(_) => {
                        // reader thread gone without a final event
                        self.source_rx = None;
                        self.scheduled = false;
                    }
                },
                recv(queue_rx) -> event => if let Ok(event) = event {
                    self.handle_queue_event(event);
                },
                recv(watchdog_rx) -> _ => self.on_watchdog_tick(),
                recv(status_tick) -> _ => {}
            }

            self.publish_status();

            if self.shutdown {
                break;
            }
        }
    }

    // --- commands ---

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Configure(update, reply) => {
                let accepted = !self.started;
                if accepted {
                    self.apply_config(update);
                }
                let _ = reply.send(accepted);
            }
            Command::SetParserFactory(factory, reply) => {
                let accepted = !self.started;
                if accepted {
                    self.parser_factory = Some(factory);
                }
                let _ = reply.send(accepted);
            }
            Command::SetQueueFactory(factory, reply) => {
                let accepted = !self.started;
                if accepted {
                    self.queue_factory = Some(factory);
                }
                let _ = reply.send(accepted);
            }
            Command::SetProxy(proxy) => {
                self.cfg.proxy = Some(proxy);
            }
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause());
            }
            Command::Play(reply) => {
                let _ = reply.send(self.play());
            }
            Command::Stop(reply) => {
                self.user_stop();
                let _ = reply.send(());
            }
            Command::SeekToTime(seconds, reply) => {
                let _ = reply.send(self.seek_to_time(seconds));
            }
            Command::SetVolume(volume, reply) => {
                let ok = match self.queue.as_mut() {
                    Some(queue) => queue.set_volume(volume.clamp(0.0, 1.0)).is_ok(),
                    None => false,
                };
                let _ = reply.send(ok);
            }
            Command::FadeTo(volume, duration) => {
                if let Some(queue) = self.queue.as_mut() {
                    let _ = queue.fade_to(volume.clamp(0.0, 1.0), duration);
                }
            }
            Command::Shutdown => {
                if !self.state.is_terminal() {
                    self.last_progress = self.progress_estimate();
                }
                self.teardown();
                self.shutdown = true;
            }
        }
    }

    fn apply_config(&mut self, update: ConfigUpdate) {
        match update {
            ConfigUpdate::BufferCount(count) => self.cfg.buffer_count = count,
            ConfigUpdate::BufferSize(size) => self.cfg.buffer_size = size,
            ConfigUpdate::TimeoutInterval(interval) => self.cfg.timeout_interval = interval,
            ConfigUpdate::PlaybackRate(rate) => self.cfg.playback_rate = rate,
            ConfigUpdate::BufferInfinite(infinite) => self.cfg.buffer_infinite = infinite,
            ConfigUpdate::FileType(file_type) => self.cfg.file_type_hint = Some(file_type),
        }
    }

    // --- lifecycle ---

    fn start(&mut self) -> bool {
        if self.started {
            return false;
        }
        debug!(url = %self.url, "starting stream");
        self.started = true;
        self.open_source();
        self.watchdog = Some(tick(self.cfg.timeout_interval));
        self.transition(State::WaitingForData);
        true
    }

    fn pause(&mut self) -> bool {
        if self.state != State::Playing {
            return false;
        }
        let Some(queue) = self.queue.as_mut() else {
            return false;
        };
        if let Err(e) = queue.pause() {
            self.fail_with(StreamError::AudioQueuePauseFailed(e.reason().to_string()));
            return false;
        }
        self.transition(State::Paused);
        true
    }

    fn play(&mut self) -> bool {
        if self.state != State::Paused {
            return false;
        }
        let Some(queue) = self.queue.as_mut() else {
            return false;
        };
        if let Err(e) = queue.resume() {
            self.fail_with(StreamError::AudioQueueStartFailed(e.reason().to_string()));
            return false;
        }
        self.transition(State::Playing);
        true
    }

    /// User-initiated stop. Idempotent; a stream that already ended keeps
    /// its terminal state and error.
    fn user_stop(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.last_progress = self.progress_estimate();
        self.teardown();
        self.transition(State::Stopped);
    }

    /// Release every resource: watchdog, byte source (and parked packets),
    /// audio queue, pool, parser. Leaves the state untouched.
    fn teardown(&mut self) {
        self.watchdog = None;
        self.close_source();
        if let Some(mut queue) = self.queue.take() {
            let _ = queue.stop(true);
        }
        self.queue_started = false;
        self.pool = None;
        self.waiting_on_buffer = false;
        self.sniffer = None;
        self.parser = None;
        while self.queue_rx.try_recv().is_ok() {}
    }

    /// Record the first failure, tear down, and finish as `Done`.
    /// Subsequent calls are no-ops.
    fn fail_with(&mut self, error: StreamError) {
        if self.error.is_some() || self.state.is_terminal() {
            return;
        }
        warn!(%error, "stream failed");
        self.last_progress = self.progress_estimate();
        self.error = Some(error);
        self.teardown();
        self.transition(State::Done);
    }

    /// Clean end of stream (no error).
    fn complete_eof(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.last_progress = self.progress_estimate();
        self.teardown();
        self.transition(State::Done);
    }

    fn transition(&mut self, next: State) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
        self.publish_status();
        self.bus.emit(StreamerEvent::StatusChanged(next));
    }

    // --- byte source ---

    fn open_source(&mut self) {
        let chunk_size = self.packet_buffer_size.max(MIN_CHUNK_SIZE);
        let (source, rx) = ByteSource::open(ByteSourceRequest {
            url: self.url.clone(),
            proxy: self.cfg.proxy.clone(),
            seek_byte_offset: self.seek_byte_offset,
            file_length: self.file_length,
            chunk_size,
        });
        self.source = Some(source);
        self.source_rx = Some(rx);
        self.source_eof = false;
        self.scheduled = true;
        self.wd_unscheduled = false;
        self.wd_rescheduled = false;
        if self.seek_byte_offset > 0 {
            self.discontinuous = self.asbd.map(|a| a.is_vbr()).unwrap_or(false);
        }
    }

    fn close_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
        self.source_rx = None;
        self.scheduled = false;
        self.fifo.clear();
    }

    /// Handle up to the per-wakeup chunk limit beyond the first event.
    fn drain_source_chunks(&mut self) {
        for _ in 1..CHUNKS_PER_WAKEUP {
            if !self.scheduled || self.state.is_terminal() {
                break;
            }
            let Some(rx) = self.source_rx.clone() else {
                break;
            };
            match rx.try_recv() {
                Ok(event) => self.handle_source_event(event),
                Err(_) => break,
            }
        }
    }

    fn handle_source_event(&mut self, event: SourceEvent) {
        self.events_since_last_tick += 1;
        match event {
            SourceEvent::Opened {
                headers,
                content_length,
                content_type,
            } => self.on_opened(headers, content_length, content_type),
            SourceEvent::Bytes(chunk) => self.on_bytes(chunk),
            SourceEvent::End => self.on_end(),
            SourceEvent::Error(message) => {
                self.fail_with(StreamError::NetworkConnectionFailed(message));
            }
        }
    }

    fn on_opened(
        &mut self,
        headers: HashMap<String, String>,
        content_length: Option<u64>,
        content_type: Option<String>,
    ) {
        if self.state.is_terminal() {
            return;
        }
        self.headers = headers;
        if self.file_length == 0 && self.seek_byte_offset == 0 {
            if let Some(length) = content_length {
                self.file_length = length;
            }
        }
        if self.parser.is_none() {
            let (file_type, defaulted) = match self.cfg.file_type_hint {
                Some(hint) => (hint, false),
                None => AudioFileType::derive(content_type.as_deref(), &self.url),
            };
            self.file_type = file_type;
            if defaulted {
                self.sniffer = Some(ShoutcastSniffer::new());
            }
            self.open_parser();
        }
    }

    fn open_parser(&mut self) {
        let Some(factory) = self.parser_factory.as_mut() else {
            self.fail_with(StreamError::FileStreamOpenFailed(
                "no parser factory installed".to_string(),
            ));
            return;
        };
        match factory.open(self.file_type) {
            Ok(parser) => self.parser = Some(parser),
            Err(e) => self.fail_with(StreamError::FileStreamOpenFailed(e.reason().to_string())),
        }
    }

    fn on_bytes(&mut self, chunk: Vec<u8>) {
        if self.state.is_terminal() {
            return;
        }

        if let Some(sniffer) = self.sniffer.as_mut() {
            let result = sniffer.sniff(&chunk);
            if result.finished {
                self.sniffer = None;
            }
            if let Some(mime) = result.content_type {
                self.sniffer_reset(&mime);
                if self.state.is_terminal() {
                    return;
                }
            }
        }

        let Some(parser) = self.parser.as_mut() else {
            return;
        };
        let events = match parser.parse_bytes(&chunk, self.discontinuous) {
            Ok(events) => events,
            Err(e) => {
                self.fail_with(StreamError::FileStreamParseBytesFailed(
                    e.reason().to_string(),
                ));
                return;
            }
        };
        for event in events {
            if self.state.is_terminal() {
                break;
            }
            self.on_parser_event(event);
        }
    }

    /// The sniffer found an inline content type: reopen the parser with
    /// the corrected type, dropping any queue built on the wrong one.
    fn sniffer_reset(&mut self, mime: &str) {
        debug!(mime, "inline content-type sniffed; reopening parser");
        self.parser = None;
        if let Some(mut queue) = self.queue.take() {
            let _ = queue.stop(true);
            let _ = queue.reset();
        }
        self.queue_started = false;
        self.pool = None;
        self.fifo.clear();
        self.waiting_on_buffer = false;
        self.asbd = None;
        self.bitrate = BitrateEstimator::new();
        while self.queue_rx.try_recv().is_ok() {}
        self.file_type = AudioFileType::from_mime(mime).unwrap_or(AudioFileType::Mp3);
        self.transition(State::WaitingForData);
        self.open_parser();
    }

    fn on_end(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.source_eof = true;
        self.scheduled = false;

        // flush a partial fill buffer
        if self.queue.is_some() && self.partial_fill_pending() {
            if self.enqueue_buffer() == Feed::Failed {
                return;
            }
        }

        if self.queue.is_some() {
            if !self.queue_started {
                let used = self.pool.as_ref().map(|p| p.buffers_used()).unwrap_or(0);
                if used > 0 {
                    self.start_audio_queue();
                } else if self.seek_byte_offset > 0 {
                    // seeked past the end
                    self.complete_eof();
                } else {
                    self.fail_with(StreamError::AudioDataNotFound(
                        "stream ended before any audio was buffered".to_string(),
                    ));
                }
            } else if self.fifo.is_empty() {
                if let Some(queue) = self.queue.as_mut() {
                    if let Err(e) = queue.flush() {
                        self.fail_with(StreamError::AudioQueueFlushFailed(
                            e.reason().to_string(),
                        ));
                    }
                }
            }
        } else if self.seek_byte_offset > 0 {
            self.complete_eof();
        } else {
            self.fail_with(StreamError::AudioDataNotFound(
                "stream ended before any audio data was found".to_string(),
            ));
        }
    }

    // --- parser events ---

    fn on_parser_event(&mut self, event: ParserEvent) {
        match event {
            ParserEvent::DataOffset(offset) => {
                self.data_offset = offset;
                if self.audio_data_byte_count > 0 {
                    self.file_length = self.data_offset + self.audio_data_byte_count;
                }
            }
            ParserEvent::AudioDataByteCount(count) => {
                self.audio_data_byte_count = count;
                self.file_length = self.data_offset + count;
            }
            ParserEvent::DataFormat(asbd) => {
                if self.asbd.is_none() {
                    debug!(
                        sample_rate = asbd.sample_rate,
                        vbr = asbd.is_vbr(),
                        "stream format discovered"
                    );
                    self.asbd = Some(asbd);
                }
            }
            ParserEvent::FormatList(formats) => {
                if self.asbd.is_none() {
                    self.asbd = formats.first().copied();
                }
            }
            ParserEvent::ReadyToProducePackets => {}
            ParserEvent::Packets { data, descriptions } => {
                self.discontinuous = false;
                self.on_packets(data, descriptions);
            }
        }
    }

    fn on_packets(&mut self, data: Vec<u8>, descriptions: Option<Vec<PacketDescription>>) {
        if self.state.is_terminal() {
            return;
        }

        if self.queue.is_none() {
            // First packets: size the stream, then build the output side.
            // A restart re-delivers these packets from the aligned offset.
            if self.file_length > 0 && self.discover_total_packets() {
                return;
            }
            self.create_queue();
            if self.state.is_terminal() {
                return;
            }
        }

        if self.waiting_on_buffer || !self.fifo.is_empty() {
            self.park_packets(&data, descriptions.as_deref(), 0);
            return;
        }

        match descriptions {
            Some(descs) => {
                for (i, desc) in descs.iter().enumerate() {
                    let start = desc.start_offset.max(0) as usize;
                    let end = start + desc.byte_size as usize;
                    if end > data.len() {
                        self.fail_with(StreamError::FileStreamParseBytesFailed(
                            "packet descriptor outside delivered data".to_string(),
                        ));
                        return;
                    }
                    match self.feed_vbr(&data[start..end], desc) {
                        Feed::Continue => {}
                        Feed::Stop { consumed } => {
                            let from = if consumed { i + 1 } else { i };
                            self.park_packets(&data, Some(descs.as_slice()), from);
                            return;
                        }
                        Feed::Failed => return,
                    }
                }
            }
            None => {
                if let NodeOutcome::Blocked(Some(rest)) =
                    self.feed_node(QueuedPacket::Cbr { data })
                {
                    self.fifo.push(rest);
                }
            }
        }
    }

    /// Copy packets (from index `from` onwards) into the overflow FIFO.
    /// Descriptors are bounds-checked exactly like the direct-feed path.
    fn park_packets(&mut self, data: &[u8], descriptions: Option<&[PacketDescription]>, from: usize) {
        match descriptions {
            Some(descs) => {
                for desc in &descs[from..] {
                    let start = desc.start_offset.max(0) as usize;
                    let end = start + desc.byte_size as usize;
                    if end > data.len() {
                        self.fail_with(StreamError::FileStreamParseBytesFailed(
                            "packet descriptor outside delivered data".to_string(),
                        ));
                        return;
                    }
                    self.fifo.push(QueuedPacket::Vbr {
                        desc: *desc,
                        data: data[start..end].to_vec(),
                    });
                }
            }
            None => {
                self.fifo.push(QueuedPacket::Cbr {
                    data: data.to_vec(),
                });
            }
        }
    }

    // --- total-packets discovery ---

    /// Bisect the parser's packet space to learn the total packet count,
    /// then realign everything at packet 0. Returns true when the byte
    /// source was restarted (the caller drops its in-flight packets).
    fn discover_total_packets(&mut self) -> bool {
        if self.discovered_packets.is_some() {
            return false;
        }
        let Some(parser) = self.parser.as_mut() else {
            return false;
        };

        let mut lower: u64 = 0;
        let mut upper: u64 = PACKET_DISCOVERY_UPPER;
        let mut last_ok: Option<u64> = None;
        while upper - lower > 1 {
            let mid = (lower + upper) / 2;
            if parser.seek_to_packet(mid).is_ok() {
                last_ok = Some(mid);
                lower = mid;
            } else {
                upper = mid;
            }
        }
        let total = match last_ok {
            Some(last) => last + 1,
            None => PACKET_DISCOVERY_UPPER,
        };
        self.discovered_packets = Some(total);
        debug!(total, "packet count discovered");

        // realign the parser and the network stream at packet 0
        match parser.seek_to_packet(0) {
            Ok(byte_offset) => {
                self.seek_byte_offset = self.data_offset + byte_offset;
                self.close_source();
                self.open_source();
                true
            }
            Err(_) => false,
        }
    }

    // --- audio queue ---

    fn create_queue(&mut self) {
        let Some(asbd) = self.asbd else {
            self.fail_with(StreamError::AudioQueueCreationFailed(
                "no stream format discovered".to_string(),
            ));
            return;
        };
        let Some(factory) = self.queue_factory.as_mut() else {
            self.fail_with(StreamError::AudioQueueCreationFailed(
                "no audio queue factory installed".to_string(),
            ));
            return;
        };
        let mut queue = match factory.create(&asbd, self.queue_tx.clone()) {
            Ok(queue) => queue,
            Err(e) => {
                self.fail_with(e);
                return;
            }
        };
        self.queue_started = false;

        // parser upper bound → largest observed packet → configured size
        let parser = self.parser.as_ref();
        let bound = parser
            .and_then(|p| p.packet_size_upper_bound())
            .filter(|&v| v > 0)
            .or_else(|| parser.and_then(|p| p.maximum_packet_size()).filter(|&v| v > 0));
        self.packet_buffer_size = bound.map(|v| v as usize).unwrap_or(self.cfg.buffer_size);

        if let Err(e) = queue.allocate_buffers(self.cfg.buffer_count, self.packet_buffer_size) {
            self.fail_with(StreamError::AudioQueueBufferAllocationFailed(
                e.reason().to_string(),
            ));
            return;
        }
        self.pool = Some(BufferPool::new(self.cfg.buffer_count, self.packet_buffer_size));

        if let Some(cookie) = self.parser.as_ref().and_then(|p| p.magic_cookie()) {
            if let Err(e) = queue.set_magic_cookie(&cookie) {
                debug!(error = %e, "magic cookie rejected by queue");
            }
        }
        self.queue = Some(queue);
    }

    fn start_audio_queue(&mut self) {
        let rate = self.cfg.playback_rate;
        let bypass = (rate - 1.0).abs() < f32::EPSILON || self.file_length == 0;
        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        if let Err(e) = queue.set_playback_rate(rate, bypass) {
            self.fail_with(StreamError::AudioQueueStartFailed(e.reason().to_string()));
            return;
        }
        if let Err(e) = queue.start() {
            self.fail_with(StreamError::AudioQueueStartFailed(e.reason().to_string()));
            return;
        }
        self.queue_started = true;
        if self.state == State::WaitingForData {
            self.transition(State::WaitingForQueueToStart);
        }
    }

    // --- enqueue protocol ---

    /// Hand the fill buffer to the audio queue and advance the cursor.
    fn enqueue_buffer(&mut self) -> Feed {
        let (count, used, submit_error) = {
            let (Some(pool), Some(queue)) = (self.pool.as_mut(), self.queue.as_mut()) else {
                return Feed::Failed;
            };
            pool.mark_fill_in_use();
            let (index, data, descs) = pool.staged();
            let error = queue.enqueue_buffer(index, data, descs).err();
            (pool.count(), pool.buffers_used(), error)
        };
        if let Some(e) = submit_error {
            self.fail_with(StreamError::AudioQueueEnqueueFailed(e.reason().to_string()));
            return Feed::Failed;
        }

        // start the queue once enough buffers are banked
        if !self.queue_started && (count < 3 || used > 2) {
            self.start_audio_queue();
            if self.state.is_terminal() {
                return Feed::Failed;
            }
        }

        if let Some(pool) = self.pool.as_mut() {
            pool.advance();
        }

        // end of stream with nothing parked: let the tail play out
        if self.fifo.is_empty() && self.source_eof {
            if let Some(queue) = self.queue.as_mut() {
                if let Err(e) = queue.flush() {
                    self.fail_with(StreamError::AudioQueueFlushFailed(e.reason().to_string()));
                    return Feed::Failed;
                }
            }
        }

        let exhausted = self.pool.as_ref().map(|p| p.fill_in_use()).unwrap_or(false);
        if exhausted {
            if !self.cfg.buffer_infinite {
                self.scheduled = false;
                self.wd_unscheduled = true;
                self.wd_rescheduled = false;
            }
            self.waiting_on_buffer = true;
            Feed::Stop { consumed: true }
        } else {
            Feed::Continue
        }
    }

    // --- packet handlers ---

    /// VBR handler: one packet, one descriptor.
    fn feed_vbr(&mut self, bytes: &[u8], desc: &PacketDescription) -> Feed {
        let Some(pool) = self.pool.as_ref() else {
            return Feed::Failed;
        };
        let capacity = pool.capacity();
        let has_room = pool.has_room(bytes.len());

        if desc.byte_size as usize > capacity {
            self.fail_with(StreamError::AudioBufferTooSmall(format!(
                "packet of {} bytes exceeds buffer size {}",
                desc.byte_size, capacity
            )));
            return Feed::Failed;
        }

        if !has_room {
            match self.enqueue_buffer() {
                Feed::Continue => {}
                Feed::Stop { .. } => return Feed::Stop { consumed: false },
                Feed::Failed => return Feed::Failed,
            }
        }

        if let Some(asbd) = self.asbd {
            self.bitrate.record_packet(desc.byte_size, asbd.packet_duration());
        }
        self.maybe_post_bitrate();

        let Some(pool) = self.pool.as_mut() else {
            return Feed::Failed;
        };
        pool.write_packet(bytes, Some(desc.variable_frames));

        if pool.descs_full() {
            match self.enqueue_buffer() {
                Feed::Continue => Feed::Continue,
                Feed::Stop { .. } => Feed::Stop { consumed: true },
                Feed::Failed => Feed::Failed,
            }
        } else {
            Feed::Continue
        }
    }

    /// CBR handler: copy as much of `bytes` as fits, reporting how much.
    fn feed_cbr_chunk(&mut self, bytes: &[u8]) -> (Feed, usize) {
        let Some(pool) = self.pool.as_ref() else {
            return (Feed::Failed, 0);
        };
        let size = bytes.len();
        let remaining = pool.capacity() - pool.bytes_filled();
        if remaining < size && pool.bytes_filled() > 0 {
            match self.enqueue_buffer() {
                Feed::Continue => {}
                Feed::Stop { .. } => return (Feed::Stop { consumed: false }, 0),
                Feed::Failed => return (Feed::Failed, 0),
            }
        }

        let Some(pool) = self.pool.as_mut() else {
            return (Feed::Failed, 0);
        };
        let remaining = pool.capacity() - pool.bytes_filled();
        let copy = size.min(remaining);
        pool.write_packet(&bytes[..copy], None);
        self.maybe_post_bitrate();
        (Feed::Continue, copy)
    }

    fn maybe_post_bitrate(&mut self) {
        if let Some(asbd) = self.asbd {
            if let Some(rate) = self.bitrate.take_ready(&asbd) {
                debug!(rate, "bitrate estimate ready");
                self.bus.emit(StreamerEvent::BitrateReady(rate));
            }
        }
    }

    /// Feed one packet node (direct path and FIFO drain share this).
    fn feed_node(&mut self, packet: QueuedPacket) -> NodeOutcome {
        match packet {
            QueuedPacket::Vbr { desc, data } => match self.feed_vbr(&data, &desc) {
                Feed::Continue => NodeOutcome::Consumed,
                Feed::Stop { consumed: true } => NodeOutcome::Blocked(None),
                Feed::Stop { consumed: false } => {
                    NodeOutcome::Blocked(Some(QueuedPacket::Vbr { desc, data }))
                }
                Feed::Failed => NodeOutcome::Failed,
            },
            QueuedPacket::Cbr { data } => {
                let mut offset = 0;
                loop {
                    if offset >= data.len() {
                        return NodeOutcome::Consumed;
                    }
                    let (feed, copied) = self.feed_cbr_chunk(&data[offset..]);
                    offset += copied;
                    match feed {
                        Feed::Continue => {}
                        Feed::Stop { .. } => {
                            let rest = if offset < data.len() {
                                Some(QueuedPacket::Cbr {
                                    data: data[offset..].to_vec(),
                                })
                            } else {
                                None
                            };
                            return NodeOutcome::Blocked(rest);
                        }
                        Feed::Failed => return NodeOutcome::Failed,
                    }
                }
            }
        }
    }

    /// Whether the fill buffer holds bytes and is ours to submit
    fn partial_fill_pending(&self) -> bool {
        self.pool
            .as_ref()
            .map(|p| p.bytes_filled() > 0 && !p.fill_in_use())
            .unwrap_or(false)
    }

    /// Drain parked packets after a buffer completed; reschedule the byte
    /// source once the FIFO is fully empty.
    fn drain_fifo(&mut self) {
        loop {
            let Some(packet) = self.fifo.pop() else {
                break;
            };
            match self.feed_node(packet) {
                NodeOutcome::Consumed => {}
                NodeOutcome::Blocked(repark) => {
                    if let Some(packet) = repark {
                        self.fifo.push_front(packet);
                    }
                    return;
                }
                NodeOutcome::Failed => return,
            }
        }
        // the stream already ended: nothing else will trigger submission
        // of the tail still sitting in the fill buffer
        if self.source_eof && self.partial_fill_pending() {
            if self.enqueue_buffer() == Feed::Failed {
                return;
            }
        }
        if !self.cfg.buffer_infinite && !self.scheduled && !self.source_eof {
            self.scheduled = true;
            self.wd_rescheduled = true;
        }
    }

    // --- queue events ---

    fn handle_queue_event(&mut self, event: QueueEvent) {
        if self.queue.is_none() {
            return;
        }
        match event {
            QueueEvent::BufferComplete(index) => self.on_buffer_complete(index),
            QueueEvent::IsRunning(running) => self.on_is_running(running),
        }
    }

    fn on_buffer_complete(&mut self, index: usize) {
        let Some(pool) = self.pool.as_mut() else {
            return;
        };
        if index >= pool.count() || !pool.is_in_use(index) {
            // stale completion from a queue generation that no longer exists
            return;
        }
        pool.complete(index);

        if self.state == State::Stopped {
            return;
        }

        let used = pool.buffers_used();
        if used == 0 && self.fifo.is_empty() && self.source_eof {
            if let Some(queue) = self.queue.as_mut() {
                if let Err(e) = queue.stop(false) {
                    self.fail_with(StreamError::AudioQueueStopFailed(e.reason().to_string()));
                }
            }
        } else if self.waiting_on_buffer {
            self.waiting_on_buffer = false;
            self.drain_fifo();
        }
    }

    fn on_is_running(&mut self, running: bool) {
        if running {
            if self.state == State::WaitingForQueueToStart {
                self.transition(State::Playing);
            }
        } else if !self.state.is_terminal() && !self.seeking {
            // the queue wound down outside a seek: natural end of stream
            self.complete_eof();
        }
    }

    // --- seek ---

    fn seek_to_time(&mut self, seconds: f64) -> bool {
        if !self.started || self.state.is_terminal() {
            return false;
        }
        let Some(asbd) = self.asbd else {
            return false;
        };
        let Some(rate) = self.bitrate.rate(&asbd).filter(|r| *r > 0.0) else {
            return false;
        };
        let Some(duration) = self.duration_estimate().filter(|d| *d > 0.0) else {
            return false;
        };
        if self.file_length <= self.data_offset {
            return false;
        }

        let target = seconds.clamp(0.0, duration);
        let span = (self.file_length - self.data_offset) as f64;
        let naive = self.data_offset as f64 + (target / duration) * span;
        let trailer = SEEK_TRAILER_BUFFERS * self.packet_buffer_size as u64;
        let cap = self.file_length.saturating_sub(trailer);
        let mut seek_byte_offset = (naive as u64).min(cap);
        let mut seek_time = target;

        // packet alignment via the parser. The trailer cap still binds:
        // an aligned offset inside the trailer region is clamped back,
        // trading alignment for trailer room on the last buffers. The
        // time adjustment is signed so it tracks the final offset in
        // either direction.
        let packet_duration = asbd.packet_duration();
        if packet_duration > 0.0 {
            let seek_packet = (target / packet_duration).floor() as u64;
            if let Some(parser) = self.parser.as_mut() {
                if let Ok(aligned) = parser.seek_to_packet(seek_packet) {
                    let aligned_abs = (self.data_offset + aligned).min(cap);
                    let delta = aligned_abs as i64 - seek_byte_offset as i64;
                    seek_time += delta as f64 * 8.0 / rate;
                    seek_byte_offset = aligned_abs;
                }
            }
        }

        debug!(target, seek_byte_offset, "seeking");
        self.seek_byte_offset = seek_byte_offset;
        self.seek_time = seek_time.max(0.0);
        self.seeking = true;

        self.close_source();

        if let Some(queue) = self.queue.as_mut() {
            if let Err(e) = queue.stop(true) {
                self.seeking = false;
                self.fail_with(StreamError::AudioQueueStopFailed(e.reason().to_string()));
                return false;
            }
            self.queue_started = false;
        }
        if let Some(pool) = self.pool.as_mut() {
            pool.reset();
        }
        self.waiting_on_buffer = false;

        // consume the hard stop's callbacks while the seek guard is up
        while let Ok(event) = self.queue_rx.try_recv() {
            self.handle_queue_event(event);
        }

        self.open_source();
        self.seeking = false;
        true
    }

    // --- watchdog ---

    fn on_watchdog_tick(&mut self) {
        if !self.started || self.state.is_terminal() {
            return;
        }
        if self.state == State::Paused {
            return;
        }
        if self.source_eof {
            // the tail is draining; no network data is expected
            return;
        }
        if self.wd_unscheduled && self.wd_rescheduled {
            // this sample straddled the unscheduled gap
            self.wd_unscheduled = false;
            self.wd_rescheduled = false;
            return;
        }
        if self.wd_unscheduled {
            // no expectation of network data
            return;
        }
        if self.events_since_last_tick > 0 {
            self.events_since_last_tick = 0;
            return;
        }
        self.fail_with(StreamError::TimedOut(format!(
            "no network events within {:?}",
            self.cfg.timeout_interval
        )));
    }

    // --- reporting ---

    fn duration_estimate(&self) -> Option<f64> {
        let asbd = self.asbd?;
        estimate_duration(
            self.parser.as_ref().and_then(|p| p.audio_data_packet_count()),
            self.discovered_packets,
            asbd.packet_duration(),
            self.file_length,
            self.data_offset,
            self.bitrate.rate(&asbd),
        )
    }

    fn progress_estimate(&self) -> f64 {
        if self.state.is_terminal() {
            return self.last_progress;
        }
        let sample_time = self
            .queue
            .as_ref()
            .and_then(|q| q.sample_time().ok())
            .unwrap_or(0.0);
        let sample_rate = self.asbd.map(|a| a.sample_rate).unwrap_or(0.0);
        let progress = if sample_rate > 0.0 {
            self.seek_time + sample_time / sample_rate
        } else {
            self.seek_time
        };
        // the queue's clock can dip below zero right after a restart
        progress.max(0.0)
    }

    fn publish_status(&self) {
        if let Ok(mut snapshot) = self.status.lock() {
            snapshot.state = self.state;
            snapshot.error = self.error.clone();
            snapshot.progress = if self.started {
                Some(self.progress_estimate())
            } else {
                None
            };
            snapshot.duration = self.duration_estimate();
            snapshot.bit_rate = self
                .asbd
                .and_then(|a| self.bitrate.rate(&a))
                .filter(|r| *r > 0.0);
            snapshot.buffers_used = self.pool.as_ref().map(|p| p.buffers_used()).unwrap_or(0);
            snapshot.events_since_last_tick = self.events_since_last_tick;
            snapshot.response_headers = self.headers.clone();
        }
    }
}

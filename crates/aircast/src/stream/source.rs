//! HTTP(S) byte source
//!
//! Opens a single blocking GET on a background thread and delivers the
//! response as `SourceEvent`s over a bounded channel. The channel bound
//! provides natural backpressure: while the engine has the source
//! unscheduled, at most a few chunks pile up and the reader thread blocks
//! on send until the engine drains again or drops the receiver.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::config::network::{CHUNKS_PER_WAKEUP, CONNECT_TIMEOUT_SECS, USER_AGENT};
use crate::stream::types::{format_range_header, ProxyConfig, ProxyKind, SourceEvent};

/// Everything needed to open one connection
#[derive(Debug, Clone)]
pub struct ByteSourceRequest {
    pub url: String,
    pub proxy: Option<ProxyConfig>,
    /// Byte offset to resume from; a `Range:` header is sent when this is
    /// non-zero and `file_length` is known
    pub seek_byte_offset: u64,
    /// Total resource length when known, 0 otherwise
    pub file_length: u64,
    /// Network read chunk size
    pub chunk_size: usize,
}

/// A live byte source connection.
///
/// Dropping (or calling [`ByteSource::close`]) signals the reader thread to
/// stop. A reader blocked on a full event channel unblocks once the paired
/// receiver is dropped, so the engine drops both together.
pub struct ByteSource {
    stop_flag: Arc<AtomicBool>,
    _handle: Option<JoinHandle<()>>,
}

impl ByteSource {
    /// Open a connection, spawning the reader thread.
    ///
    /// All network work happens on the thread; connection failures arrive
    /// as [`SourceEvent::Error`].
    pub fn open(request: ByteSourceRequest) -> (Self, Receiver<SourceEvent>) {
        let (event_tx, event_rx) = bounded::<SourceEvent>(CHUNKS_PER_WAKEUP);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_clone = stop_flag.clone();

        let handle = thread::Builder::new()
            .name("aircast-source".to_string())
            .spawn(move || {
                read_stream(request, event_tx, stop_clone);
            })
            .ok();

        (
            Self {
                stop_flag,
                _handle: handle,
            },
            event_rx,
        )
    }

    /// Signal the reader thread to stop. The thread exits at its next
    /// read or send boundary.
    pub fn close(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

impl Drop for ByteSource {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

/// Build the blocking HTTP client for a request, applying proxy selection.
fn build_client(request: &ByteSourceRequest) -> reqwest::Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS));

    if let Some(ref proxy) = request.proxy {
        match proxy.kind {
            // reqwest consults environment proxy settings by default
            ProxyKind::System => {}
            ProxyKind::Http => {
                let target = format!("http://{}:{}", proxy.host, proxy.port);
                let p = if request.url.starts_with("https") {
                    reqwest::Proxy::https(&target)?
                } else {
                    reqwest::Proxy::http(&target)?
                };
                builder = builder.proxy(p);
            }
            ProxyKind::Socks => {
                let target = format!("socks5://{}:{}", proxy.host, proxy.port);
                builder = builder.proxy(reqwest::Proxy::all(&target)?);
            }
        }
    }

    builder.build()
}

/// Reader thread body: connect, emit `Opened`, then stream chunks until
/// EOF, error, or the stop flag.
fn read_stream(request: ByteSourceRequest, events: Sender<SourceEvent>, stop_flag: Arc<AtomicBool>) {
    let client = match build_client(&request) {
        Ok(c) => c,
        Err(e) => {
            let _ = events.send(SourceEvent::Error(e.to_string()));
            return;
        }
    };

    let mut get = client.get(&request.url);
    if request.file_length > 0 && request.seek_byte_offset > 0 {
        let range = format_range_header(request.seek_byte_offset, request.file_length);
        debug!(url = %request.url, %range, "opening ranged request");
        get = get.header(reqwest::header::RANGE, range);
    } else {
        debug!(url = %request.url, "opening request");
    }

    let mut response = match get.send() {
        Ok(r) => r,
        Err(e) => {
            let _ = events.send(SourceEvent::Error(e.to_string()));
            return;
        }
    };

    if !response.status().is_success() {
        let _ = events.send(SourceEvent::Error(format!("HTTP {}", response.status())));
        return;
    }

    let mut headers = std::collections::HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_string(), v.to_string());
        }
    }
    let content_length = response.content_length();
    let content_type = headers.get("content-type").cloned();

    if events
        .send(SourceEvent::Opened {
            headers,
            content_length,
            content_type,
        })
        .is_err()
    {
        return;
    }

    let mut chunk = vec![0u8; request.chunk_size.max(1)];
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return;
        }

        match response.read(&mut chunk) {
            Ok(0) => {
                let _ = events.send(SourceEvent::End);
                return;
            }
            Ok(n) => {
                // Blocks while the bounded channel is full (engine has the
                // source unscheduled); unblocks when the receiver drains or
                // is dropped.
                if events.send(SourceEvent::Bytes(chunk[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) => {
                if !stop_flag.load(Ordering::SeqCst) {
                    let _ = events.send(SourceEvent::Error(e.to_string()));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    /// Serve one canned HTTP response on a local port, capturing the
    /// request text. Returns (url, request-text receiver).
    fn serve_once(response: Vec<u8>) -> (String, Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (req_tx, req_rx) = bounded(1);

        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while let Ok(1) = stream.read(&mut byte) {
                    request.push(byte[0]);
                    if request.ends_with(b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = req_tx.send(String::from_utf8_lossy(&request).to_string());
                let _ = stream.write_all(&response);
            }
        });

        (format!("http://{}/stream.mp3", addr), req_rx)
    }

    fn http_response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {}\r\n", status);
        for (k, v) in headers {
            out.push_str(&format!("{}: {}\r\n", k, v));
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(body);
        bytes
    }

    fn plain_request(url: String) -> ByteSourceRequest {
        ByteSourceRequest {
            url,
            proxy: None,
            seek_byte_offset: 0,
            file_length: 0,
            chunk_size: 2048,
        }
    }

    fn collect_events(rx: &Receiver<SourceEvent>) -> Vec<SourceEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.recv_timeout(Duration::from_secs(5)) {
            let done = matches!(ev, SourceEvent::End | SourceEvent::Error(_));
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    #[test]
    fn delivers_opened_bytes_end() {
        let body = vec![42u8; 5000];
        let (url, _req) = serve_once(http_response(
            "200 OK",
            &[("Content-Type", "audio/mpeg")],
            &body,
        ));

        let (_source, rx) = ByteSource::open(plain_request(url));
        let events = collect_events(&rx);

        match &events[0] {
            SourceEvent::Opened {
                content_length,
                content_type,
                ..
            } => {
                assert_eq!(*content_length, Some(5000));
                assert_eq!(content_type.as_deref(), Some("audio/mpeg"));
            }
            other => panic!("expected Opened, got {:?}", other),
        }

        let total: usize = events
            .iter()
            .filter_map(|e| match e {
                SourceEvent::Bytes(b) => Some(b.len()),
                _ => None,
            })
            .sum();
        assert_eq!(total, 5000);
        assert!(matches!(events.last(), Some(SourceEvent::End)));
    }

    #[test]
    fn sends_range_header_when_resuming() {
        let (url, req_rx) = serve_once(http_response("206 Partial Content", &[], &[0u8; 10]));

        let (_source, rx) = ByteSource::open(ByteSourceRequest {
            url,
            proxy: None,
            seek_byte_offset: 481_000,
            file_length: 1_000_000,
            chunk_size: 2048,
        });
        let _ = collect_events(&rx);

        let request = req_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(
            request.to_lowercase().contains("range: bytes=481000-999999"),
            "missing range header in request:\n{}",
            request
        );
    }

    #[test]
    fn no_range_header_at_offset_zero() {
        let (url, req_rx) = serve_once(http_response("200 OK", &[], &[0u8; 10]));

        let (_source, rx) = ByteSource::open(ByteSourceRequest {
            url,
            proxy: None,
            seek_byte_offset: 0,
            file_length: 1_000_000,
            chunk_size: 2048,
        });
        let _ = collect_events(&rx);

        let request = req_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!request.to_lowercase().contains("range:"));
    }

    #[test]
    fn no_range_header_when_length_unknown() {
        let (url, req_rx) = serve_once(http_response("200 OK", &[], &[0u8; 10]));

        let (_source, rx) = ByteSource::open(ByteSourceRequest {
            url,
            proxy: None,
            seek_byte_offset: 500,
            file_length: 0,
            chunk_size: 2048,
        });
        let _ = collect_events(&rx);

        let request = req_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!request.to_lowercase().contains("range:"));
    }

    #[test]
    fn sends_user_agent() {
        let (url, req_rx) = serve_once(http_response("200 OK", &[], &[]));

        let (_source, rx) = ByteSource::open(plain_request(url));
        let _ = collect_events(&rx);

        let request = req_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(request.contains("aircast/"));
    }

    #[test]
    fn connection_refused_yields_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_source, rx) = ByteSource::open(plain_request(format!("http://{}/x", addr)));
        let events = collect_events(&rx);
        assert!(matches!(events.last(), Some(SourceEvent::Error(_))));
    }

    #[test]
    fn http_error_status_yields_error() {
        let (url, _req) = serve_once(http_response("404 Not Found", &[], b"gone"));

        let (_source, rx) = ByteSource::open(plain_request(url));
        let events = collect_events(&rx);

        match events.last() {
            Some(SourceEvent::Error(msg)) => assert!(msg.contains("404"), "got: {}", msg),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn close_stops_delivery() {
        let body = vec![7u8; 200_000];
        let (url, _req) = serve_once(http_response("200 OK", &[], &body));

        let (mut source, rx) = ByteSource::open(plain_request(url));

        // Take the first event or two, then close and drop the receiver
        let _ = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        source.close();
        drop(rx);
        // Reader thread exits via stop flag or the dropped receiver; nothing
        // to assert beyond not hanging.
    }
}

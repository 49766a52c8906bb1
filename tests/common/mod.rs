#![allow(dead_code)]

use bytes::Bytes;
use http_tpc::{
    HandleId, Method, RangeRequest, ResponseSink, SizeProbe, SocketFd, StorageFile, Transport,
    TransportError, TransportEvent,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic content of the remote file at `offset`.
pub fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8
}

pub fn pattern_bytes(start: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| pattern(start + i)).collect()
}

/// How the scripted remote answers one range request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `206 Partial Content` with the requested bytes.
    Partial,
    /// An error status with the given body.
    Error { status: u16, body: &'static str },
    /// Headers only; the body never arrives.
    Hang,
    /// `206` but the response ends cleanly after `keep` bytes.
    Truncate { keep: u64 },
    /// `206` and the connection resets after `keep` bytes.
    Reset { keep: u64 },
}

/// When the scripted remote answers an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAnswer {
    /// After every byte of the body has arrived.
    AfterUpload,
    /// Immediately; the upload body is never drained.
    Early,
    /// The request ends without any response at all.
    Silent,
}

struct Exchange {
    headers: VecDeque<String>,
    next: u64,
    end: u64,
    error_body: Option<Bytes>,
    hang: bool,
    done: bool,
    upload: Option<(u64, Vec<u8>)>,
    /// Hold the response back until the upload is complete.
    gated: bool,
    socket: Option<SocketFd>,
    fail: Option<String>,
}

/// In-memory network engine with a scripted remote.
pub struct MockTransport {
    pub size: Option<u64>,
    pub probe_status: u16,
    pub chunk: usize,
    pub replies: HashMap<u64, Reply>,
    pub ranges: Vec<(u64, u64)>,
    pub requests: Vec<RangeRequest>,
    pub max_active: usize,
    pub removed: Vec<HandleId>,
    pub uploaded: Arc<Mutex<Vec<u8>>>,
    pub push_status: u16,
    pub push_answer: PushAnswer,
    pub announce_sockets: bool,
    exchanges: BTreeMap<HandleId, Exchange>,
    paused: HashSet<HandleId>,
    seen: HashSet<HandleId>,
    cursor: usize,
}

impl MockTransport {
    pub fn new(size: u64) -> Self {
        Self {
            size: Some(size),
            probe_status: 200,
            chunk: 64 * 1024,
            replies: HashMap::new(),
            ranges: Vec::new(),
            requests: Vec::new(),
            max_active: 0,
            removed: Vec::new(),
            uploaded: Arc::new(Mutex::new(Vec::new())),
            push_status: 201,
            push_answer: PushAnswer::AfterUpload,
            announce_sockets: false,
            exchanges: BTreeMap::new(),
            paused: HashSet::new(),
            seen: HashSet::new(),
            cursor: 0,
        }
    }

    pub fn reply_at(mut self, start: u64, reply: Reply) -> Self {
        self.replies.insert(start, reply);
        self
    }

    pub fn active(&self) -> usize {
        self.exchanges.len()
    }

    fn has_ready(&self) -> bool {
        self.exchanges
            .iter()
            .any(|(h, ex)| !self.paused.contains(h) && Self::ready(ex))
    }

    fn ready(ex: &Exchange) -> bool {
        if ex.done {
            return false;
        }
        if ex.socket.is_some() {
            return true;
        }
        if let Some((expected, received)) = &ex.upload {
            if ex.gated {
                return received.len() as u64 >= *expected;
            }
        }
        !ex.headers.is_empty() || !ex.hang
    }

    fn next_event(handle: HandleId, ex: &mut Exchange, chunk: usize) -> Option<TransportEvent> {
        if let Some(fd) = ex.socket.take() {
            let addr: SocketAddr = "127.0.0.1:8443".parse().ok()?;
            return Some(TransportEvent::SocketOpened { handle, fd, addr });
        }
        if let Some(line) = ex.headers.pop_front() {
            return Some(TransportEvent::Header { handle, line });
        }
        if ex.hang {
            return None;
        }
        if let Some(body) = ex.error_body.take() {
            return Some(TransportEvent::Body { handle, data: body });
        }
        if ex.next < ex.end {
            let len = (ex.end - ex.next).min(chunk as u64) as usize;
            let data = Bytes::from(pattern_bytes(ex.next, len));
            ex.next += len as u64;
            return Some(TransportEvent::Body { handle, data });
        }
        ex.done = true;
        let result = match ex.fail.take() {
            Some(msg) => Err(msg),
            None => Ok(()),
        };
        Some(TransportEvent::Done { handle, result })
    }
}

impl Transport for MockTransport {
    fn add(&mut self, handle: HandleId, request: RangeRequest) -> Result<(), TransportError> {
        if self.exchanges.contains_key(&handle) {
            return Err(TransportError::Handle(handle));
        }
        let socket = (self.announce_sockets && self.seen.insert(handle))
            .then_some(100 + handle as SocketFd);
        self.requests.push(request.clone());
        let exchange = match (request.method, request.range) {
            (Method::Put, _) => {
                let silent = self.push_answer == PushAnswer::Silent;
                let headers = if silent {
                    VecDeque::new()
                } else {
                    VecDeque::from(vec![
                        format!("HTTP/1.1 {} Done", self.push_status),
                        String::new(),
                    ])
                };
                Exchange {
                    headers,
                    next: 0,
                    end: 0,
                    error_body: (!silent && self.push_status >= 400)
                        .then(|| Bytes::from_static(b"upload refused")),
                    hang: false,
                    done: false,
                    upload: Some((request.upload_length.unwrap_or(0), Vec::new())),
                    gated: self.push_answer == PushAnswer::AfterUpload,
                    socket,
                    fail: None,
                }
            }
            (_, Some((start, end))) => {
                self.ranges.push((start, end));
                let reply = self.replies.get(&start).cloned().unwrap_or(Reply::Partial);
                let mut exchange = Exchange {
                    headers: VecDeque::new(),
                    next: start,
                    end: end + 1,
                    error_body: None,
                    hang: false,
                    done: false,
                    upload: None,
                    gated: false,
                    socket,
                    fail: None,
                };
                match reply {
                    Reply::Partial => {
                        exchange.headers.push_back("HTTP/1.1 206 Partial Content".into());
                        exchange
                            .headers
                            .push_back(format!("Content-Length: {}", end + 1 - start));
                    }
                    Reply::Error { status, body } => {
                        exchange.headers.push_back(format!("HTTP/1.1 {status} Error"));
                        exchange.error_body = Some(Bytes::from_static(body.as_bytes()));
                        exchange.end = start;
                    }
                    Reply::Hang => {
                        exchange.headers.push_back("HTTP/1.1 206 Partial Content".into());
                        exchange.hang = true;
                    }
                    Reply::Truncate { keep } => {
                        exchange.headers.push_back("HTTP/1.1 206 Partial Content".into());
                        exchange.end = start + keep;
                    }
                    Reply::Reset { keep } => {
                        exchange.headers.push_back("HTTP/1.1 206 Partial Content".into());
                        exchange.end = start + keep;
                        exchange.fail = Some("Recv failure: Connection reset by peer".into());
                    }
                }
                exchange.headers.push_back(String::new());
                exchange
            }
            (_, None) => return Err(TransportError::Engine("unexpected request".into())),
        };
        self.exchanges.insert(handle, exchange);
        self.max_active = self.max_active.max(self.exchanges.len());
        Ok(())
    }

    fn remove(&mut self, handle: HandleId) -> Result<(), TransportError> {
        self.paused.remove(&handle);
        self.removed.push(handle);
        self.exchanges
            .remove(&handle)
            .map(|_| ())
            .ok_or(TransportError::Handle(handle))
    }

    fn pause(&mut self, handle: HandleId) {
        self.paused.insert(handle);
    }

    fn resume(&mut self, handle: HandleId) {
        self.paused.remove(&handle);
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        let handles: Vec<HandleId> = self.exchanges.keys().copied().collect();
        let n = handles.len();
        for step in 0..n {
            let handle = handles[(self.cursor + step) % n];
            if self.paused.contains(&handle) {
                continue;
            }
            let chunk = self.chunk;
            let Some(ex) = self.exchanges.get_mut(&handle) else {
                continue;
            };
            if let Some((expected, received)) = &ex.upload {
                if ex.gated && (received.len() as u64) < *expected && ex.socket.is_none() {
                    continue;
                }
            }
            if let Some(event) = Self::next_event(handle, ex, chunk) {
                self.cursor = (self.cursor + step + 1) % n.max(1);
                return Some(event);
            }
        }
        None
    }

    fn upload(&mut self, handle: HandleId, data: Bytes) -> Result<bool, TransportError> {
        let ex = self
            .exchanges
            .get_mut(&handle)
            .ok_or(TransportError::Handle(handle))?;
        if !ex.gated {
            return Ok(false);
        }
        let Some((_, received)) = ex.upload.as_mut() else {
            return Err(TransportError::Engine("not an upload".into()));
        };
        received.extend_from_slice(&data);
        self.uploaded
            .lock()
            .map_err(|_| TransportError::Engine("poisoned".into()))?
            .extend_from_slice(&data);
        Ok(true)
    }

    async fn wait(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if self.has_ready() {
            return Ok(true);
        }
        tokio::time::sleep(timeout).await;
        Ok(false)
    }

    async fn probe_size(&mut self, _request: RangeRequest) -> Result<SizeProbe, TransportError> {
        Ok(SizeProbe {
            status: self.probe_status,
            content_length: self.size,
        })
    }
}

#[derive(Debug, Default)]
pub struct FileStats {
    pub written: u64,
    pub writes: Vec<(u64, usize)>,
    pub mismatches: usize,
    pub closed: bool,
}

/// A destination file that checks every committed byte against `pattern`
/// instead of storing it.
#[derive(Clone, Default)]
pub struct PatternFile {
    pub stats: Arc<Mutex<FileStats>>,
}

impl StorageFile for PatternFile {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let mut stats = self.stats.lock().unwrap();
        let bad = data
            .iter()
            .enumerate()
            .filter(|(i, b)| **b != pattern(offset + *i as u64))
            .count();
        stats.mismatches += bad;
        stats.written += data.len() as u64;
        stats.writes.push((offset, data.len()));
        Ok(data.len())
    }

    fn read_at(&mut self, _offset: u64, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.stats.lock().unwrap().written)
    }

    fn close(&mut self) -> io::Result<()> {
        self.stats.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Records everything sent to the TPC client.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub started: Option<(u16, String)>,
    pub chunks: Vec<String>,
    pub finished: bool,
    pub simple: Option<(u16, String)>,
}

impl RecordingSink {
    pub fn markers(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.starts_with("Perf Marker"))
            .count()
    }

    pub fn last(&self) -> Option<&str> {
        self.chunks.last().map(String::as_str)
    }
}

impl ResponseSink for RecordingSink {
    fn start_chunked(&mut self, status: u16, reason: &str, _headers: &[(&str, &str)]) -> io::Result<()> {
        self.started = Some((status, reason.to_string()));
        Ok(())
    }

    fn send_chunk(&mut self, chunk: &str) -> io::Result<()> {
        self.chunks.push(chunk.to_string());
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        Ok(())
    }

    fn send_simple(&mut self, status: u16, body: &str) -> io::Result<()> {
        self.simple = Some((status, body.to_string()));
        Ok(())
    }
}

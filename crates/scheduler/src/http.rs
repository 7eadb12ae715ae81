//! HTTP fetcher backed by a fixed pool of worker threads.
//!
//! Each worker owns at most one request at a time, so the pool size is the
//! in-flight limit. Submitted tasks wait in a channel until a worker is
//! free. Besides `http://` and `https://`, `file://` URLs are served from
//! the local filesystem, which is how offline datasets and tests are fed.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mapstream_cache::{unix_now, ByteBuffer};
use tracing::{debug, warn};

use crate::{
    fetch_channel, CancellationRegistry, FetchCompleter, FetchError, FetchHandle, FetchId,
    FetchReply, FetchResult, FetchTask, Fetcher,
};

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Number of worker threads, and so the number of concurrent requests.
    /// Default: 4.
    pub max_in_flight: usize,

    /// Default: 10s.
    pub connect_timeout: Duration,

    /// Overall per-request deadline. Default: 30s.
    pub timeout: Duration,

    /// Replies with larger bodies fail with a network error. Default: 64 MB.
    pub max_body_size: u64,

    pub user_agent: String,

    /// How long an idle worker waits before re-checking for shutdown.
    /// Default: 50ms.
    pub poll_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            max_body_size: 64 * 1024 * 1024,
            user_agent: concat!("mapstream/", env!("CARGO_PKG_VERSION")).to_string(),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl FetcherConfig {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_body_size(mut self, bytes: u64) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

struct Job {
    id: FetchId,
    task: FetchTask,
    completer: FetchCompleter,
}

struct Shared {
    agent: ureq::Agent,
    config: FetcherConfig,
    registry: CancellationRegistry,
    shutdown: AtomicBool,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
}

/// Worker-pool [`Fetcher`] over `ureq`.
///
/// Dropping the fetcher cancels every outstanding fetch and joins the
/// workers. A request already on the wire runs to its timeout first.
pub struct HttpFetcher {
    shared: Arc<Shared>,
    sender: Option<Sender<Job>>,
    receiver: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> io::Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build();

        let workers_wanted = config.max_in_flight.max(1);
        let shared = Arc::new(Shared {
            agent,
            config,
            registry: CancellationRegistry::new(),
            shutdown: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        });
        let (sender, receiver) = crossbeam_channel::unbounded();

        let mut fetcher = Self {
            shared,
            sender: Some(sender),
            receiver,
            workers: Vec::with_capacity(workers_wanted),
            next_id: AtomicU64::new(1),
        };

        for id in 0..workers_wanted {
            let shared = fetcher.shared.clone();
            let receiver = fetcher.receiver.clone();
            // On failure `fetcher` is dropped, which stops the workers spawned so far
            let worker = thread::Builder::new()
                .name(format!("mapstream-fetch-{id}"))
                .spawn(move || Self::run(shared, receiver))?;
            fetcher.workers.push(worker);
        }

        Ok(fetcher)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Requests currently on the wire.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Tasks waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Cancels outstanding fetches and waits for the workers to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.shared.registry.cancel_all();
        self.sender = None;

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("fetch worker panicked");
            }
        }

        while let Ok(job) = self.receiver.try_recv() {
            self.shared.registry.unregister(job.id);
            job.completer.complete(Err(FetchError::Cancelled));
        }
        debug!(cancelled, "http fetcher stopped");
    }

    fn run(shared: Arc<Shared>, receiver: Receiver<Job>) {
        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            let job = match receiver.recv_timeout(shared.config.poll_interval) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            shared.queued.fetch_sub(1, Ordering::AcqRel);

            let Job { id, task, completer } = job;
            let result = if completer.is_cancelled() {
                Err(FetchError::Cancelled)
            } else {
                shared.in_flight.fetch_add(1, Ordering::AcqRel);
                let result = execute(&shared.agent, &shared.config, &task);
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                result
            };
            let result = match result {
                Ok(_) if completer.is_cancelled() => Err(FetchError::Cancelled),
                other => other,
            };

            match &result {
                Ok(reply) => debug!(
                    url = %task.url,
                    code = reply.http_code,
                    bytes = reply.bytes.len(),
                    "fetch complete"
                ),
                Err(error) => debug!(url = %task.url, %error, "fetch failed"),
            }

            shared.registry.unregister(id);
            completer.complete(result);
        }
    }
}

impl Fetcher for HttpFetcher {
    fn submit(&self, task: FetchTask) -> FetchHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shared.registry.register(id);
        let (handle, completer) = fetch_channel(token);
        let job = Job { id, task, completer };

        let rejected = match &self.sender {
            Some(sender) if !self.is_shutting_down() => {
                self.shared.queued.fetch_add(1, Ordering::AcqRel);
                match sender.send(job) {
                    Ok(()) => None,
                    Err(err) => {
                        self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                        Some(err.into_inner())
                    }
                }
            }
            _ => Some(job),
        };

        if let Some(job) = rejected {
            self.shared.registry.unregister(job.id);
            job.completer.complete(Err(FetchError::Cancelled));
        }
        handle
    }
}

impl Drop for HttpFetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn execute(agent: &ureq::Agent, config: &FetcherConfig, task: &FetchTask) -> FetchResult {
    if let Some(path) = task.url.strip_prefix("file://") {
        return read_file(Path::new(path), config.max_body_size);
    }

    let mut request = agent.get(&task.url);
    for (name, value) in &task.headers {
        request = request.set(name, value);
    }

    let response = match request.call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => return Err(FetchError::HttpStatus(code)),
        Err(ureq::Error::Transport(transport)) => return Err(classify_transport(&transport)),
    };

    let http_code = response.status();
    let content_type = response.header("Content-Type").map(str::to_string);
    let etag = response.header("ETag").map(str::to_string);
    let expires_at = response
        .header("Cache-Control")
        .and_then(parse_max_age)
        .map(|max_age| unix_now().saturating_add(max_age));

    if http_code == 304 {
        return Ok(FetchReply {
            etag,
            expires_at,
            content_type,
            ..FetchReply::not_modified()
        });
    }
    if !(200..300).contains(&http_code) {
        return Err(FetchError::HttpStatus(http_code));
    }

    let mut data = Vec::new();
    response
        .into_reader()
        .take(config.max_body_size.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(classify_io)?;
    if data.len() as u64 > config.max_body_size {
        return Err(FetchError::Network(format!(
            "response body exceeds {} bytes",
            config.max_body_size
        )));
    }

    Ok(FetchReply {
        bytes: ByteBuffer::from(data),
        http_code,
        content_type,
        etag,
        expires_at,
    })
}

fn read_file(path: &Path, max_body_size: u64) -> FetchResult {
    let metadata = fs::metadata(path).map_err(file_error)?;
    if metadata.len() > max_body_size {
        return Err(FetchError::Network(format!(
            "{} exceeds {} bytes",
            path.display(),
            max_body_size
        )));
    }
    let data = fs::read(path).map_err(file_error)?;
    Ok(FetchReply::ok(ByteBuffer::from(data)))
}

fn file_error(err: io::Error) -> FetchError {
    match err.kind() {
        io::ErrorKind::NotFound => FetchError::HttpStatus(404),
        io::ErrorKind::PermissionDenied => FetchError::HttpStatus(403),
        _ => FetchError::Network(err.to_string()),
    }
}

fn classify_io(err: io::Error) -> FetchError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FetchError::Timeout,
        _ => FetchError::Network(err.to_string()),
    }
}

fn classify_transport(transport: &ureq::Transport) -> FetchError {
    let mut source = std::error::Error::source(transport);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ) {
                return FetchError::Timeout;
            }
        }
        source = inner.source();
    }

    let message = transport.to_string();
    if message.to_ascii_lowercase().contains("timed out") {
        FetchError::Timeout
    } else {
        FetchError::Network(message)
    }
}

/// Extracts `max-age` seconds from a Cache-Control value. `no-cache` and
/// `no-store` mean the body is stale immediately.
fn parse_max_age(cache_control: &str) -> Option<u64> {
    let mut max_age = None;
    for directive in cache_control.split(',').map(str::trim) {
        let lower = directive.to_ascii_lowercase();
        if lower == "no-cache" || lower == "no-store" {
            return Some(0);
        }
        if let Some(value) = lower.strip_prefix("max-age=") {
            max_age = value.trim_matches('"').parse().ok();
        }
    }
    max_age
}

//! Asynchronous fetch contract.
//!
//! The data thread never blocks on the network. It submits a [`FetchTask`]
//! and gets back a [`FetchHandle`] it polls on later ticks. Whoever executes
//! the request holds the matching [`FetchCompleter`] and delivers exactly one
//! [`FetchResult`] through it.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use mapstream_cache::ByteBuffer;

use crate::CancellationToken;

/// Identifier a fetcher assigns to each submitted task.
pub type FetchId = u64;

/// One request: a URL plus extra request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl FetchTask {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A successful reply.
#[derive(Debug)]
pub struct FetchReply {
    pub bytes: ByteBuffer,
    pub http_code: u16,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    /// Unix seconds after which the body should be revalidated
    pub expires_at: Option<u64>,
}

impl FetchReply {
    /// A plain 200 reply with no metadata.
    pub fn ok(bytes: ByteBuffer) -> Self {
        Self {
            bytes,
            http_code: 200,
            content_type: None,
            etag: None,
            expires_at: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// 304 reply to a conditional request; the body is empty.
    pub fn not_modified() -> Self {
        Self {
            http_code: 304,
            ..Self::ok(ByteBuffer::new())
        }
    }

    pub fn is_not_modified(&self) -> bool {
        self.http_code == 304
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("fetch cancelled")]
    Cancelled,
}

pub type FetchResult = Result<FetchReply, FetchError>;

/// Executes fetch tasks off the calling thread.
///
/// `submit` must return immediately. Implementations bound the number of
/// requests they run concurrently; excess tasks wait in their queue.
pub trait Fetcher: Send + Sync {
    fn submit(&self, task: FetchTask) -> FetchHandle;
}

/// Requester side of a pending fetch.
///
/// Dropping the handle before the result arrives cancels the fetch.
#[derive(Debug)]
pub struct FetchHandle {
    receiver: Receiver<FetchResult>,
    token: CancellationToken,
    done: bool,
}

/// Executor side of a pending fetch.
#[derive(Debug)]
pub struct FetchCompleter {
    sender: Sender<FetchResult>,
    token: CancellationToken,
}

/// Creates a connected handle/completer pair sharing `token`.
pub fn fetch_channel(token: CancellationToken) -> (FetchHandle, FetchCompleter) {
    let (sender, receiver) = crossbeam_channel::bounded(1);
    (
        FetchHandle {
            receiver,
            token: token.clone(),
            done: false,
        },
        FetchCompleter { sender, token },
    )
}

impl FetchHandle {
    /// A handle that is already resolved, for fetchers that fail on submit.
    pub fn resolved(result: FetchResult) -> Self {
        let (handle, completer) = fetch_channel(CancellationToken::new());
        completer.complete(result);
        handle
    }

    /// Non-blocking poll. Yields the result once; later calls return `None`.
    ///
    /// A completer dropped without delivering reads as a network error.
    pub fn poll(&mut self) -> Option<FetchResult> {
        if self.done {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(result) => {
                self.done = true;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.done = true;
                Some(Err(FetchError::Network("fetch abandoned".to_string())))
            }
        }
    }

    /// Blocks up to `timeout` for the result.
    pub fn wait(&mut self, timeout: Duration) -> Option<FetchResult> {
        if self.done {
            return None;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => {
                self.done = true;
                Some(result)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.done = true;
                Some(Err(FetchError::Network("fetch abandoned".to_string())))
            }
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        if !self.done {
            self.token.cancel();
        }
    }
}

impl FetchCompleter {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Delivers the result. A handle that has gone away is not an error.
    pub fn complete(self, result: FetchResult) {
        let _ = self.sender.send(result);
    }
}

//! Mapstream Scheduler Library
//!
//! Threads that keep resource loading off the render thread: the
//! asynchronous fetch contract with its cancellation tokens, the worker-pool
//! HTTP fetcher, and the background data thread that drives a session.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mapstream_scheduler::{FetchTask, Fetcher, FetcherConfig, HttpFetcher};
//!
//! let fetcher = Arc::new(HttpFetcher::new(FetcherConfig::new(4)).unwrap());
//! let mut handle = fetcher.submit(FetchTask::new("https://tiles.example/12/2200/1343.png"));
//!
//! // The data thread polls instead of waiting
//! if let Some(Ok(reply)) = handle.wait(Duration::from_secs(5)) {
//!     println!("{} bytes", reply.bytes.len());
//! }
//! ```

mod cancel;
mod data_thread;
mod fetcher;
mod http;

pub use cancel::{CancellationRegistry, CancellationToken};
pub use data_thread::{DataSession, DataThread, DataThreadConfig};
pub use fetcher::{
    fetch_channel, FetchCompleter, FetchError, FetchHandle, FetchId, FetchReply, FetchResult,
    FetchTask, Fetcher,
};
pub use http::{FetcherConfig, HttpFetcher};

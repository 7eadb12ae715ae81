//! Mapstream Core Library
//!
//! Resource lifecycle and cache engine for a streaming terrain renderer.
//!
//! Resources (meta tiles, meshes, textures, bound-layer imagery) are
//! requested by key from a [`ResourceCacheManager`], then advanced by the
//! data thread through disk lookup, download and decoding, and finally
//! uploaded to the GPU by the render thread. Settled resources nobody holds
//! are evicted least-recently-used first whenever memory use exceeds the
//! budget.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mapstream_cache::CacheConfig;
//! use mapstream_core::{
//!     HeadlessUploader, MapResources, ResourceKind, SessionConfig, StandardDecoder,
//! };
//! use mapstream_scheduler::{DataThread, DataThreadConfig, FetcherConfig, HttpFetcher};
//!
//! let session = Arc::new(MapResources::new(
//!     SessionConfig::new(CacheConfig::default()),
//!     Arc::new(StandardDecoder),
//! ));
//! let fetcher = Arc::new(HttpFetcher::new(FetcherConfig::default()).unwrap());
//! let data = DataThread::spawn(fetcher, DataThreadConfig::default()).unwrap();
//! data.attach(session.clone());
//!
//! let tile = session.acquire("https://tiles.example/12/2200/1343.png", ResourceKind::Texture);
//! let mut gpu = HeadlessUploader::new();
//! while !tile.state().is_settled() {
//!     session.render_tick(&mut gpu);
//! }
//! ```

pub mod availability;
pub mod decoder;
pub mod error;
pub mod gpu;
pub mod kind;
pub mod manager;
pub mod resource;
pub mod session;

pub use availability::AvailabilityTest;
pub use decoder::{ResourceDecoder, StandardDecoder};
pub use error::{PrepareError, ResourceError};
pub use gpu::{GpuHandle, GpuUploader, HeadlessUploader};
pub use kind::{PreparedPayload, ResourceKind, TextureData};
pub use manager::{ResourceCacheManager, TickReport};
pub use resource::{Footprint, RecordHandle, ResourceKey, ResourceState};
pub use session::{MapResources, RenderTickReport, SessionConfig, INTERNAL_SCHEME};

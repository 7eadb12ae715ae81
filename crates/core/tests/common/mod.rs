#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use mapstream_cache::{ByteBuffer, CacheConfig};
use mapstream_core::{
    GpuUploader, MapResources, PrepareError, PreparedPayload, ResourceDecoder, ResourceKey,
    ResourceKind, SessionConfig,
};
use mapstream_scheduler::{
    fetch_channel, CancellationToken, FetchCompleter, FetchError, FetchHandle, FetchReply,
    FetchTask, Fetcher,
};

pub const MB: usize = 1024 * 1024;

/// What the scripted fetcher answers for a URL.
#[derive(Clone)]
pub enum Script {
    Reply {
        bytes: Vec<u8>,
        etag: Option<String>,
        content_type: Option<String>,
    },
    NotModified,
    Fail(FetchError),
    /// Keep the fetch pending until the test completes it
    Hold,
}

impl Script {
    pub fn bytes(bytes: Vec<u8>) -> Self {
        Script::Reply {
            bytes,
            etag: None,
            content_type: None,
        }
    }
}

/// Fetcher that answers from a script and records every submission.
/// Unknown URLs fail with HTTP 404.
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    submissions: Mutex<Vec<FetchTask>>,
    held: Mutex<HashMap<String, FetchCompleter>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }

    pub fn submissions(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    pub fn submissions_for(&self, url: &str) -> Vec<FetchTask> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .filter(|task| task.url == url)
            .cloned()
            .collect()
    }

    pub fn is_cancelled(&self, url: &str) -> bool {
        self.held
            .lock()
            .unwrap()
            .get(url)
            .map_or(false, FetchCompleter::is_cancelled)
    }

    /// Delivers a result for a held fetch.
    pub fn complete(&self, url: &str, result: Result<FetchReply, FetchError>) {
        let completer = self
            .held
            .lock()
            .unwrap()
            .remove(url)
            .expect("no held fetch for url");
        completer.complete(result);
    }
}

impl Fetcher for ScriptedFetcher {
    fn submit(&self, task: FetchTask) -> FetchHandle {
        self.submissions.lock().unwrap().push(task.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&task.url)
            .cloned()
            .unwrap_or(Script::Fail(FetchError::HttpStatus(404)));

        match script {
            Script::Reply {
                bytes,
                etag,
                content_type,
            } => {
                let mut reply = FetchReply::ok(ByteBuffer::from(bytes));
                reply.etag = etag;
                reply.content_type = content_type;
                FetchHandle::resolved(Ok(reply))
            }
            Script::NotModified => FetchHandle::resolved(Ok(FetchReply::not_modified())),
            Script::Fail(err) => FetchHandle::resolved(Err(err)),
            Script::Hold => {
                let (handle, completer) = fetch_channel(CancellationToken::new());
                self.held.lock().unwrap().insert(task.url, completer);
                handle
            }
        }
    }
}

/// Keeps bytes as they are: meshes stay meshes, everything else is a blob.
pub struct PassthroughDecoder;

impl ResourceDecoder for PassthroughDecoder {
    fn decode(
        &self,
        kind: ResourceKind,
        _key: &ResourceKey,
        bytes: ByteBuffer,
    ) -> Result<PreparedPayload, PrepareError> {
        Ok(match kind {
            ResourceKind::Mesh => PreparedPayload::Mesh(bytes),
            _ => PreparedPayload::Blob(bytes),
        })
    }
}

pub fn cache_config(dir: &Path, budget: usize) -> CacheConfig {
    CacheConfig::default()
        .with_memory_budget(budget)
        .with_disk_dir(dir)
        .with_disk_mb(64)
}

pub fn session(config: CacheConfig) -> MapResources {
    MapResources::new(SessionConfig::new(config), Arc::new(PassthroughDecoder))
}

/// Alternates data and render ticks.
pub fn pump(session: &MapResources, gpu: &mut dyn GpuUploader, rounds: usize) {
    use mapstream_scheduler::DataSession;
    for _ in 0..rounds {
        session.data_tick();
        session.render_tick(gpu);
    }
}

//! The background data thread.
//!
//! One long-lived thread drives a [`DataSession`]: it waits until a session
//! is attached, initializes it with the fetcher, then calls
//! [`DataSession::data_tick`] until stopped. After a tick that did work the
//! thread sleeps briefly; after an idle tick it sleeps longer. When stopped
//! the session is finalized on the same thread before the thread exits.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::Fetcher;

/// Work driven by the data thread. All three calls happen on that thread.
pub trait DataSession: Send + Sync {
    fn data_initialize(&self, fetcher: Arc<dyn Fetcher>);

    /// Returns `true` when the tick did any work.
    fn data_tick(&self) -> bool;

    fn data_finalize(&self);
}

/// Configuration for [`DataThread`].
#[derive(Debug, Clone)]
pub struct DataThreadConfig {
    /// Polling period while no session is attached. Default: 1ms.
    pub attach_poll_interval: Duration,

    /// Sleep after a tick that did work. Default: 5ms.
    pub busy_interval: Duration,

    /// Sleep after an idle tick. Default: 20ms.
    pub idle_interval: Duration,
}

impl Default for DataThreadConfig {
    fn default() -> Self {
        Self {
            attach_poll_interval: Duration::from_millis(1),
            busy_interval: Duration::from_millis(5),
            idle_interval: Duration::from_millis(20),
        }
    }
}

impl DataThreadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_busy_interval(mut self, interval: Duration) -> Self {
        self.busy_interval = interval;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_attach_poll_interval(mut self, interval: Duration) -> Self {
        self.attach_poll_interval = interval;
        self
    }
}

type SessionSlot = Arc<Mutex<Option<Arc<dyn DataSession>>>>;

/// Owner of the data thread. Dropping it stops and joins the thread.
pub struct DataThread {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    session: SessionSlot,
}

impl DataThread {
    /// Starts the thread. It idles until [`attach`](Self::attach) is called.
    pub fn spawn(fetcher: Arc<dyn Fetcher>, config: DataThreadConfig) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let session: SessionSlot = Arc::new(Mutex::new(None));

        let thread = {
            let shutdown = shutdown.clone();
            let session = session.clone();
            thread::Builder::new()
                .name("mapstream-data".to_string())
                .spawn(move || Self::run(fetcher, session, shutdown, config))?
        };

        Ok(Self {
            thread: Some(thread),
            shutdown,
            session,
        })
    }

    /// Hands the session to the thread. Only the first attach takes effect.
    pub fn attach(&self, session: Arc<dyn DataSession>) -> bool {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(session);
        true
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the loop, lets the session finalize, and joins the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("data thread panicked");
            }
        }
    }

    fn run(
        fetcher: Arc<dyn Fetcher>,
        slot: SessionSlot,
        shutdown: Arc<AtomicBool>,
        config: DataThreadConfig,
    ) {
        let session = loop {
            if shutdown.load(Ordering::Acquire) {
                debug!("data thread stopped before a session was attached");
                return;
            }
            let attached = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(session) = attached {
                break session;
            }
            thread::sleep(config.attach_poll_interval);
        };

        debug!("data thread initializing session");
        session.data_initialize(fetcher);

        while !shutdown.load(Ordering::Acquire) {
            let busy = session.data_tick();
            thread::sleep(if busy {
                config.busy_interval
            } else {
                config.idle_interval
            });
        }

        session.data_finalize();
        debug!("data thread finalized session");
    }
}

impl Drop for DataThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchError, FetchHandle, FetchTask};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct NullFetcher;

    impl Fetcher for NullFetcher {
        fn submit(&self, _task: FetchTask) -> FetchHandle {
            FetchHandle::resolved(Err(FetchError::Cancelled))
        }
    }

    #[derive(Default)]
    struct CountingSession {
        busy: bool,
        initialized: AtomicUsize,
        ticks: AtomicUsize,
        finalized: AtomicUsize,
        thread_names: Mutex<Vec<String>>,
    }

    impl CountingSession {
        fn busy() -> Self {
            Self {
                busy: true,
                ..Self::default()
            }
        }

        fn record_thread(&self) {
            let name = thread::current().name().unwrap_or_default().to_string();
            self.thread_names.lock().unwrap().push(name);
        }
    }

    impl DataSession for CountingSession {
        fn data_initialize(&self, _fetcher: Arc<dyn Fetcher>) {
            self.record_thread();
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }

        fn data_tick(&self) -> bool {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            self.busy
        }

        fn data_finalize(&self) {
            self.record_thread();
            self.finalized.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = DataThreadConfig::default();
        assert_eq!(config.attach_poll_interval, Duration::from_millis(1));
        assert!(config.busy_interval < config.idle_interval);
    }

    #[test]
    fn test_lifecycle_on_data_thread() {
        let data = DataThread::spawn(Arc::new(NullFetcher), DataThreadConfig::default()).unwrap();
        let session = Arc::new(CountingSession::default());

        thread::sleep(Duration::from_millis(10));
        assert_eq!(session.initialized.load(Ordering::SeqCst), 0);

        assert!(data.attach(session.clone()));
        assert!(!data.attach(Arc::new(CountingSession::default())));
        wait_for(|| session.ticks.load(Ordering::SeqCst) >= 2);

        data.shutdown();
        assert_eq!(session.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(session.finalized.load(Ordering::SeqCst), 1);
        let names = session.thread_names.lock().unwrap();
        assert!(names.iter().all(|name| name == "mapstream-data"));
    }

    #[test]
    fn test_stop_without_session() {
        let data = DataThread::spawn(Arc::new(NullFetcher), DataThreadConfig::default()).unwrap();
        assert!(!data.is_shutting_down());
        data.shutdown();
    }

    #[test]
    fn test_drop_finalizes() {
        let session = Arc::new(CountingSession::default());
        {
            let data =
                DataThread::spawn(Arc::new(NullFetcher), DataThreadConfig::default()).unwrap();
            data.attach(session.clone());
            wait_for(|| session.initialized.load(Ordering::SeqCst) == 1);
        }
        assert_eq!(session.finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_busy_ticks_run_faster_than_idle() {
        let config = DataThreadConfig::new()
            .with_busy_interval(Duration::from_millis(1))
            .with_idle_interval(Duration::from_millis(40));

        let busy = Arc::new(CountingSession::busy());
        let idle = Arc::new(CountingSession::default());
        let busy_thread = DataThread::spawn(Arc::new(NullFetcher), config.clone()).unwrap();
        let idle_thread = DataThread::spawn(Arc::new(NullFetcher), config).unwrap();
        busy_thread.attach(busy.clone());
        idle_thread.attach(idle.clone());

        thread::sleep(Duration::from_millis(200));
        busy_thread.shutdown();
        idle_thread.shutdown();

        let busy_ticks = busy.ticks.load(Ordering::SeqCst);
        let idle_ticks = idle.ticks.load(Ordering::SeqCst);
        assert!(
            busy_ticks > idle_ticks * 2,
            "busy {busy_ticks} vs idle {idle_ticks}"
        );
    }
}

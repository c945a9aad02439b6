//! Lifecycle of the shared browser used for HTML rendering.
//!
//! One browser process backs every render. It is launched lazily on the first
//! request, reused afterwards and closed once on shutdown. Concurrent first
//! requests share a single launch: the first caller stores a shared launch
//! future in the engine state and every other caller awaits a clone of it.
//! The state lock is only held while inspecting or swapping the state, never
//! across a launch or a render.

use super::HtmlRenderer;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Starts browser processes
#[async_trait]
pub trait BrowserLauncher: Send + Sync + 'static {
    type Session: BrowserSession;

    async fn launch(&self) -> Result<Self::Session>;
}

/// A live browser process able to print documents
#[async_trait]
pub trait BrowserSession: Send + Sync + 'static {
    /// Load `document` into a fresh, isolated page and print it to PDF.
    ///
    /// The page must be released on every exit path, including when the
    /// returned future is dropped before completion.
    async fn print_pdf(&self, document: &str) -> Result<Vec<u8>>;

    /// Terminate the process. Must tolerate being called more than once.
    async fn close(&self);
}

type LaunchOutcome<S> = std::result::Result<Arc<S>, String>;
type LaunchFuture<S> = Shared<BoxFuture<'static, LaunchOutcome<S>>>;

enum EngineState<S> {
    Idle,
    Launching {
        generation: u64,
        launch: LaunchFuture<S>,
    },
    Ready(Arc<S>),
}

struct Inner<S> {
    state: EngineState<S>,
    generation: u64,
}

/// Lazily launched, shared render engine
pub struct RenderEngine<L: BrowserLauncher> {
    launcher: Arc<L>,
    inner: Mutex<Inner<L::Session>>,
    render_timeout: Duration,
}

impl<L: BrowserLauncher> RenderEngine<L> {
    pub fn new(launcher: L, render_timeout: Duration) -> Self {
        Self {
            launcher: Arc::new(launcher),
            inner: Mutex::new(Inner {
                state: EngineState::Idle,
                generation: 0,
            }),
            render_timeout,
        }
    }

    /// Whether a browser process is currently live
    pub async fn is_running(&self) -> bool {
        matches!(self.inner.lock().await.state, EngineState::Ready(_))
    }

    /// Get the live session, launching one if none exists yet
    async fn acquire(&self) -> Result<Arc<L::Session>> {
        let (generation, launch) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            match &inner.state {
                EngineState::Ready(session) => return Ok(Arc::clone(session)),
                EngineState::Launching { generation, launch } => (*generation, launch.clone()),
                EngineState::Idle => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    let launcher = Arc::clone(&self.launcher);
                    let launch = async move {
                        info!("Launching render engine browser process");
                        launcher
                            .launch()
                            .await
                            .map(Arc::new)
                            .map_err(unavailable_reason)
                    }
                    .boxed()
                    .shared();
                    inner.state = EngineState::Launching {
                        generation,
                        launch: launch.clone(),
                    };
                    (generation, launch)
                }
            }
        };

        let outcome = launch.await;

        let mut inner = self.inner.lock().await;
        let still_current = matches!(
            &inner.state,
            EngineState::Launching { generation: g, .. } if *g == generation
        );

        match outcome {
            Ok(session) => {
                if still_current {
                    info!("Render engine browser process ready");
                    inner.state = EngineState::Ready(Arc::clone(&session));
                    return Ok(session);
                }
                if let EngineState::Ready(ready) = &inner.state {
                    if Arc::ptr_eq(ready, &session) {
                        return Ok(session);
                    }
                }
                // Shutdown ran while this launch was in flight.
                drop(inner);
                warn!("Render engine was shut down during launch, closing the new process");
                session.close().await;
                Err(AppError::RenderEngineUnavailable(
                    "render engine was shut down".to_string(),
                ))
            }
            Err(reason) => {
                if still_current {
                    error!("Failed to launch render engine: {}", reason);
                    inner.state = EngineState::Idle;
                }
                Err(AppError::RenderEngineUnavailable(reason))
            }
        }
    }

    /// Close the live browser process, if any. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let previous = {
            let mut inner = self.inner.lock().await;
            std::mem::replace(&mut inner.state, EngineState::Idle)
        };

        match previous {
            EngineState::Ready(session) => {
                info!("Shutting down render engine");
                session.close().await;
            }
            EngineState::Launching { .. } => {
                info!("Render engine shutdown requested while launching");
            }
            EngineState::Idle => debug!("Render engine not running, nothing to shut down"),
        }
    }
}

fn unavailable_reason(err: AppError) -> String {
    match err {
        AppError::RenderEngineUnavailable(reason) => reason,
        other => other.to_string(),
    }
}

#[async_trait]
impl<L: BrowserLauncher> HtmlRenderer for RenderEngine<L> {
    async fn render_html(&self, document: &str) -> Result<Vec<u8>> {
        let session = self.acquire().await?;

        match tokio::time::timeout(self.render_timeout, session.print_pdf(document)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Render did not finish within {}s",
                    self.render_timeout.as_secs()
                );
                Err(AppError::RenderTimeout(self.render_timeout.as_secs()))
            }
        }
    }

    async fn is_running(&self) -> bool {
        RenderEngine::is_running(self).await
    }

    async fn shutdown(&self) {
        RenderEngine::shutdown(self).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    pub(crate) struct Counters {
        pub launches: AtomicUsize,
        pub closes: AtomicUsize,
        pub open_pages: AtomicUsize,
    }

    pub(crate) struct FakeLauncher {
        pub counters: Arc<Counters>,
        pub fail: AtomicBool,
        pub launch_delay: Duration,
        pub render_delay: Duration,
        pub gate: Option<Arc<Notify>>,
    }

    impl FakeLauncher {
        pub fn new(counters: Arc<Counters>) -> Self {
            Self {
                counters,
                fail: AtomicBool::new(false),
                launch_delay: Duration::from_millis(20),
                render_delay: Duration::ZERO,
                gate: None,
            }
        }
    }

    pub(crate) struct FakeSession {
        counters: Arc<Counters>,
        render_delay: Duration,
    }

    struct PageGuard<'a>(&'a AtomicUsize);

    impl Drop for PageGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        type Session = FakeSession;

        async fn launch(&self) -> Result<FakeSession> {
            self.counters.launches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::time::sleep(self.launch_delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::RenderEngineUnavailable(
                    "browser executable not found".to_string(),
                ));
            }
            Ok(FakeSession {
                counters: Arc::clone(&self.counters),
                render_delay: self.render_delay,
            })
        }
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn print_pdf(&self, document: &str) -> Result<Vec<u8>> {
            self.counters.open_pages.fetch_add(1, Ordering::SeqCst);
            let _page = PageGuard(&self.counters.open_pages);
            tokio::time::sleep(self.render_delay).await;
            let mut pdf = b"%PDF-1.7\n".to_vec();
            pdf.extend_from_slice(document.as_bytes());
            Ok(pdf)
        }

        async fn close(&self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn engine(launcher: FakeLauncher) -> Arc<RenderEngine<FakeLauncher>> {
        Arc::new(RenderEngine::new(launcher, Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_concurrent_first_use_launches_once() {
        let counters = Arc::new(Counters::default());
        let engine = engine(FakeLauncher::new(Arc::clone(&counters)));

        let renders = (0..8).map(|i| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.render_html(&format!("<p>{}</p>", i)).await })
        });
        let results = futures::future::join_all(renders).await;

        for result in results {
            let pdf = result.unwrap().unwrap();
            assert!(pdf.starts_with(b"%PDF-"));
        }
        assert_eq!(counters.launches.load(Ordering::SeqCst), 1);
        assert!(engine.is_running().await);
    }

    #[tokio::test]
    async fn test_concurrent_launch_failure_is_shared_and_retryable() {
        let counters = Arc::new(Counters::default());
        let launcher = FakeLauncher::new(Arc::clone(&counters));
        launcher.fail.store(true, Ordering::SeqCst);
        let engine = engine(launcher);

        let renders = (0..5).map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.render_html("<p>x</p>").await })
        });
        let results = futures::future::join_all(renders).await;

        for result in results {
            match result.unwrap() {
                Err(AppError::RenderEngineUnavailable(reason)) => {
                    assert_eq!(reason, "browser executable not found")
                }
                other => panic!("unexpected: {:?}", other.map(|b| b.len())),
            }
        }
        assert_eq!(counters.launches.load(Ordering::SeqCst), 1);
        assert!(!engine.is_running().await);

        engine.launcher.fail.store(false, Ordering::SeqCst);
        assert!(engine.render_html("<p>x</p>").await.is_ok());
        assert_eq!(counters.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_without_render_is_noop() {
        let counters = Arc::new(Counters::default());
        let engine = engine(FakeLauncher::new(Arc::clone(&counters)));

        engine.shutdown().await;
        engine.shutdown().await;

        assert_eq!(counters.launches.load(Ordering::SeqCst), 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_render_after_shutdown_relaunches() {
        let counters = Arc::new(Counters::default());
        let engine = engine(FakeLauncher::new(Arc::clone(&counters)));

        engine.render_html("<p>one</p>").await.unwrap();
        engine.shutdown().await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(!engine.is_running().await);

        engine.render_html("<p>two</p>").await.unwrap();
        assert_eq!(counters.launches.load(Ordering::SeqCst), 2);

        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_render_times_out_and_releases_page() {
        let counters = Arc::new(Counters::default());
        let mut launcher = FakeLauncher::new(Arc::clone(&counters));
        launcher.render_delay = Duration::from_secs(60);
        let engine = RenderEngine::new(launcher, Duration::from_secs(2));

        let result = engine.render_html("<p>slow</p>").await;

        assert!(matches!(result, Err(AppError::RenderTimeout(2))));
        assert_eq!(counters.open_pages.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_launch_closes_late_process() {
        let counters = Arc::new(Counters::default());
        let gate = Arc::new(Notify::new());
        let mut launcher = FakeLauncher::new(Arc::clone(&counters));
        launcher.gate = Some(Arc::clone(&gate));
        let engine = engine(launcher);

        let pending = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.render_html("<p>late</p>").await })
        };
        while counters.launches.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        engine.shutdown().await;
        gate.notify_one();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(AppError::RenderEngineUnavailable(_))));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(!engine.is_running().await);
    }
}

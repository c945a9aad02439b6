use super::render::{BrowserLauncher, BrowserSession};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    EventLifecycleEvent, PrintToPdfParams, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A4 paper size in inches
const A4_WIDTH_IN: f64 = 8.27;
const A4_HEIGHT_IN: f64 = 11.69;

/// Lifecycle event Chromium emits once the network has been quiet for 500ms
const NETWORK_IDLE_EVENT: &str = "networkIdle";

/// Launches headless Chromium processes driven over CDP
#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
    /// Path to the Chrome/Chromium executable
    chrome_path: Option<String>,
}

impl ChromiumLauncher {
    pub fn new() -> Self {
        Self { chrome_path: None }
    }

    pub fn with_chrome_path(mut self, path: String) -> Self {
        self.chrome_path = Some(path);
        self
    }

    fn get_chrome_path(&self) -> String {
        if let Some(path) = &self.chrome_path {
            return path.clone();
        }

        if let Ok(path) = std::env::var("CHROME_PATH") {
            return path;
        }

        if cfg!(target_os = "macos") {
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome".to_string()
        } else if cfg!(target_os = "windows") {
            r"C:\Program Files\Google\Chrome\Application\chrome.exe".to_string()
        } else {
            for path in &[
                "/usr/bin/chromium",
                "/usr/bin/chromium-browser",
                "/usr/bin/google-chrome",
            ] {
                if std::path::Path::new(path).exists() {
                    return path.to_string();
                }
            }
            "chromium".to_string()
        }
    }

    /// Check that the executable runs, without keeping a process around
    pub async fn is_available(&self) -> bool {
        Command::new(self.get_chrome_path())
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    type Session = ChromiumSession;

    async fn launch(&self) -> Result<ChromiumSession> {
        let chrome_path = self.get_chrome_path();

        let profile = tempfile::Builder::new()
            .prefix("pdfforge-chromium-")
            .tempdir()
            .map_err(|e| {
                AppError::RenderEngineUnavailable(format!(
                    "Failed to create browser profile directory: {}",
                    e
                ))
            })?;

        let config = BrowserConfig::builder()
            .chrome_executable(&chrome_path)
            .user_data_dir(profile.path())
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--disable-translate")
            .arg("--disable-default-apps")
            .arg("--headless")
            .build()
            .map_err(|e| {
                AppError::RenderEngineUnavailable(format!(
                    "Failed to build browser config for {}: {}",
                    chrome_path, e
                ))
            })?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
            AppError::RenderEngineUnavailable(format!(
                "Failed to launch browser at {}: {}",
                chrome_path, e
            ))
        })?;

        // Drive CDP events for the lifetime of the process
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler event error: {}", e);
                }
            }
        });

        info!("Chromium browser launched via CDP ({})", chrome_path);
        Ok(ChromiumSession {
            browser: RwLock::new(Some(browser)),
            handler,
            _profile: profile,
        })
    }
}

/// One live Chromium process shared by all renders
pub struct ChromiumSession {
    /// Write-locked only to close the process
    browser: RwLock<Option<Browser>>,
    handler: JoinHandle<()>,
    _profile: TempDir,
}

impl ChromiumSession {
    async fn open_page(&self) -> Result<PageGuard> {
        let guard = self.browser.read().await;
        let browser = guard.as_ref().ok_or_else(|| {
            AppError::RenderEngineUnavailable("browser process has been closed".to_string())
        })?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::RenderFailure(format!("Failed to create new page: {}", e)))?;

        Ok(PageGuard::new(page))
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn print_pdf(&self, document: &str) -> Result<Vec<u8>> {
        let page = self.open_page().await?;

        page.page
            .execute(SetLifecycleEventsEnabledParams::new(true))
            .await
            .map_err(|e| render_failure("enable lifecycle events", e))?;
        let main_frame = page
            .page
            .mainframe()
            .await
            .map_err(|e| render_failure("resolve main frame", e))?;
        let mut lifecycle = page
            .page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(|e| render_failure("subscribe to lifecycle events", e))?;

        page.page
            .set_content(document)
            .await
            .map_err(|e| render_failure("load document", e))?;

        // document.open() restarts the frame lifecycle with "init"; only an
        // idle signal seen after that restart belongs to our content.
        let mut restarted = false;
        let mut idle = false;
        while let Some(event) = lifecycle.next().await {
            if let Some(frame) = &main_frame {
                if &event.frame_id != frame {
                    continue;
                }
            }
            match event.name.as_str() {
                "init" => restarted = true,
                NETWORK_IDLE_EVENT if restarted => {
                    idle = true;
                    break;
                }
                _ => {}
            }
        }
        if !idle {
            return Err(AppError::RenderFailure(
                "page closed before the network became idle".to_string(),
            ));
        }

        let mut params = PrintToPdfParams::default();
        params.paper_width = Some(A4_WIDTH_IN);
        params.paper_height = Some(A4_HEIGHT_IN);
        params.print_background = Some(true);

        let pdf_data = page
            .page
            .pdf(params)
            .await
            .map_err(|e| render_failure("generate PDF", e))?;

        page.close().await;
        super::pdf::normalize(&pdf_data)
    }

    async fn close(&self) {
        let browser = self.browser.write().await.take();
        if let Some(mut browser) = browser {
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser cleanly: {}", e);
            }
            if let Err(e) = browser.wait().await {
                warn!("Failed to wait for browser exit: {}", e);
            }
            info!("Chromium browser closed");
        }
        self.handler.abort();
    }
}

fn render_failure(step: &str, err: impl std::fmt::Display) -> AppError {
    AppError::RenderFailure(format!("Failed to {}: {}", step, err))
}

/// Closes its page on every exit path. Dropping an armed guard schedules
/// the close on the runtime, which covers errors and cancelled requests.
struct PageGuard {
    page: Page,
    armed: bool,
}

impl PageGuard {
    fn new(page: Page) -> Self {
        Self { page, armed: true }
    }

    async fn close(mut self) {
        self.armed = false;
        if let Err(e) = self.page.clone().close().await {
            warn!("Failed to close page: {}", e);
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let page = self.page.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = page.close().await {
                        debug!("Failed to close abandoned page: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime available to close abandoned page"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_chrome_path_wins() {
        let launcher = ChromiumLauncher::new().with_chrome_path("/opt/chrome/chrome".to_string());
        assert_eq!(launcher.get_chrome_path(), "/opt/chrome/chrome");
    }

    #[tokio::test]
    async fn test_missing_executable_is_unavailable() {
        let launcher =
            ChromiumLauncher::new().with_chrome_path("/nonexistent/pdfforge/chromium".to_string());

        assert!(!launcher.is_available().await);
        match launcher.launch().await {
            Err(AppError::RenderEngineUnavailable(reason)) => {
                assert!(reason.contains("/nonexistent/pdfforge/chromium"))
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("launch should fail without an executable"),
        }
    }
}

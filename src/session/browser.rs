//! Headless Chromium session backend
//!
//! Drives pages over CDP: injects fixed request headers and pre-seeded
//! localStorage before any page script runs, short-circuits image requests
//! with a placeholder payload, dismisses native dialogs, and converts
//! network events into `ObservedResponse`s. Only available with the
//! `browser` feature.

#[cfg(feature = "browser")]
use crate::error::{LynkeusError, Result};
#[cfg(feature = "browser")]
use crate::models::{HeaderMap, ObservedResponse, StorageItem};
#[cfg(feature = "browser")]
use crate::session::replay::{resolve_selector, RecordedScript, Step, TargetSelector};
#[cfg(feature = "browser")]
use crate::session::{SessionDriver, SessionFactory};
#[cfg(feature = "browser")]
use async_trait::async_trait;
#[cfg(feature = "browser")]
use base64::Engine as _;
#[cfg(feature = "browser")]
use chromiumoxide::browser::{Browser, BrowserConfig};
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::fetch;
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
    Headers, ResourceType, SetExtraHttpHeadersParams,
};
#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventJavascriptDialogOpening,
    HandleJavaScriptDialogParams,
};
#[cfg(feature = "browser")]
use chromiumoxide::Page;
#[cfg(feature = "browser")]
use futures::StreamExt;
#[cfg(feature = "browser")]
use std::collections::HashMap;
#[cfg(feature = "browser")]
use std::sync::atomic::{AtomicI64, Ordering};
#[cfg(feature = "browser")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "browser")]
use std::time::Duration;
#[cfg(feature = "browser")]
use tokio::sync::mpsc;
#[cfg(feature = "browser")]
use tokio::task::JoinHandle;
#[cfg(feature = "browser")]
use tokio::time::Instant;
#[cfg(feature = "browser")]
use tracing::{debug, warn};

/// Quiescence: no more than this many in-flight requests...
#[cfg(feature = "browser")]
const MAX_QUIESCENT_REQUESTS: i64 = 2;
/// ...sustained for this long
#[cfg(feature = "browser")]
const SETTLE_WINDOW: Duration = Duration::from_millis(500);
#[cfg(feature = "browser")]
const QUIESCENCE_POLL: Duration = Duration::from_millis(50);

/// 1x1 transparent GIF served in place of real images
#[cfg(feature = "browser")]
const PLACEHOLDER_IMAGE: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Launches one headless browser lazily and hands out tab-backed sessions
#[cfg(feature = "browser")]
pub struct ChromiumFactory {
    headers: HashMap<String, String>,
    local_storage: Vec<StorageItem>,
    state: tokio::sync::Mutex<Option<BrowserState>>,
}

#[cfg(feature = "browser")]
struct BrowserState {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

#[cfg(feature = "browser")]
impl ChromiumFactory {
    pub fn new(headers: HashMap<String, String>, local_storage: Vec<StorageItem>) -> Result<Self> {
        Ok(Self {
            headers,
            local_storage,
            state: tokio::sync::Mutex::new(None),
        })
    }

    async fn launch() -> Result<BrowserState> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-web-security")
            .arg("--allow-running-insecure-content")
            .arg("--disable-webgl")
            .arg("--disable-popup-blocking")
            .build()
            .map_err(|e| LynkeusError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| LynkeusError::SessionError(format!("Browser launch failed: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler event error: {e}");
                }
            }
        });

        debug!("Headless browser launched");
        Ok(BrowserState {
            browser,
            handler_task,
        })
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl SessionFactory for ChromiumFactory {
    async fn create(&self) -> Result<Arc<dyn SessionDriver>> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(Self::launch().await?);
        }
        let browser = match state.as_ref() {
            Some(s) => &s.browser,
            None => return Err(LynkeusError::SessionError("browser not running".to_string())),
        };

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| LynkeusError::SessionError(format!("Failed to open tab: {e}")))?;

        let session =
            ChromiumSession::prepare(page, &self.headers, &self.local_storage).await?;
        Ok(Arc::new(session))
    }
}

/// One browser tab with interception and event forwarding wired up
#[cfg(feature = "browser")]
pub struct ChromiumSession {
    page: tokio::sync::Mutex<Option<Page>>,
    /// Sender for the navigation currently driving this session
    current_tx: Arc<Mutex<Option<mpsc::UnboundedSender<ObservedResponse>>>>,
    in_flight: Arc<AtomicI64>,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[cfg(feature = "browser")]
impl ChromiumSession {
    async fn prepare(
        page: Page,
        headers: &HashMap<String, String>,
        local_storage: &[StorageItem],
    ) -> Result<Self> {
        let session_err = |e: chromiumoxide::error::CdpError| {
            LynkeusError::SessionError(format!("Session setup failed: {e}"))
        };

        if !headers.is_empty() {
            let header_map = Headers::new(serde_json::json!(headers));
            page.execute(SetExtraHttpHeadersParams::new(header_map))
                .await
                .map_err(session_err)?;
        }

        if !local_storage.is_empty() {
            let mut source = String::new();
            for item in local_storage {
                let name = serde_json::to_string(&item.name)?;
                let value = serde_json::to_string(&item.value)?;
                source.push_str(&format!("window.localStorage.setItem({name}, {value});\n"));
            }
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(source))
                .await
                .map_err(session_err)?;
        }

        // Intercept everything at the request stage; images get the
        // placeholder, the rest continues untouched.
        page.execute(fetch::EnableParams {
            patterns: Some(vec![fetch::RequestPattern {
                url_pattern: Some("*".to_string()),
                resource_type: None,
                request_stage: Some(fetch::RequestStage::Request),
            }]),
            handle_auth_requests: None,
        })
        .await
        .map_err(session_err)?;

        let current_tx: Arc<Mutex<Option<mpsc::UnboundedSender<ObservedResponse>>>> =
            Arc::new(Mutex::new(None));
        let in_flight = Arc::new(AtomicI64::new(0));
        let mut tasks = Vec::new();

        let mut paused = page
            .event_listener::<fetch::EventRequestPaused>()
            .await
            .map_err(session_err)?;
        let intercept_page = page.clone();
        tasks.push(tokio::spawn(async move {
            let encoder = base64::engine::general_purpose::STANDARD;
            while let Some(event) = paused.next().await {
                let request_id = event.request_id.clone();
                let result = if event.resource_type == ResourceType::Image {
                    let params = fetch::FulfillRequestParams::builder()
                        .request_id(request_id)
                        .response_code(200)
                        .response_header(fetch::HeaderEntry::new("Content-Type", "image/gif"))
                        .body(encoder.encode(PLACEHOLDER_IMAGE))
                        .build();
                    match params {
                        Ok(p) => intercept_page.execute(p).await.map(|_| ()),
                        Err(_) => continue,
                    }
                } else {
                    intercept_page
                        .execute(fetch::ContinueRequestParams::new(request_id))
                        .await
                        .map(|_| ())
                };
                if let Err(e) = result {
                    debug!("Request interception failed: {e}");
                }
            }
        }));

        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(session_err)?;
        let tx_handle = Arc::clone(&current_tx);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                let observed = ObservedResponse {
                    url: event.response.url.clone(),
                    status: event.response.status.clamp(0, u16::MAX as i64) as u16,
                    headers: convert_headers(&event.response.headers),
                };
                let guard = tx_handle.lock();
                if let Ok(guard) = guard {
                    if let Some(tx) = guard.as_ref() {
                        let _ = tx.send(observed);
                    }
                }
            }
        }));

        let mut sent = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(session_err)?;
        let counter = Arc::clone(&in_flight);
        tasks.push(tokio::spawn(async move {
            while sent.next().await.is_some() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }));

        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(session_err)?;
        let counter = Arc::clone(&in_flight);
        tasks.push(tokio::spawn(async move {
            while finished.next().await.is_some() {
                counter.fetch_sub(1, Ordering::Relaxed);
            }
        }));

        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(session_err)?;
        let counter = Arc::clone(&in_flight);
        tasks.push(tokio::spawn(async move {
            while failed.next().await.is_some() {
                counter.fetch_sub(1, Ordering::Relaxed);
            }
        }));

        let mut dialogs = page
            .event_listener::<EventJavascriptDialogOpening>()
            .await
            .map_err(session_err)?;
        let dialog_page = page.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(dialog) = dialogs.next().await {
                debug!("Dismissing dialog: {:?}", dialog.message);
                if let Err(e) = dialog_page
                    .execute(HandleJavaScriptDialogParams::new(false))
                    .await
                {
                    debug!("Dialog dismissal failed: {e}");
                }
            }
        }));

        Ok(Self {
            page: tokio::sync::Mutex::new(Some(page)),
            current_tx,
            in_flight,
            listener_tasks: Mutex::new(tasks),
        })
    }

    fn set_events(&self, events: Option<mpsc::UnboundedSender<ObservedResponse>>) {
        if let Ok(mut guard) = self.current_tx.lock() {
            *guard = events;
        }
    }

    /// Waits until no more than two requests stay in flight for the settle
    /// window. The caller bounds the overall wait with the navigation
    /// timeout.
    async fn wait_for_quiescence(&self) {
        let mut quiet_since: Option<Instant> = None;
        loop {
            if self.in_flight.load(Ordering::Relaxed) <= MAX_QUIESCENT_REQUESTS {
                match quiet_since {
                    Some(since) if since.elapsed() >= SETTLE_WINDOW => return,
                    Some(_) => {}
                    None => quiet_since = Some(Instant::now()),
                }
            } else {
                quiet_since = None;
            }
            tokio::time::sleep(QUIESCENCE_POLL).await;
        }
    }

    async fn goto(&self, url: &str) -> Result<()> {
        {
            let guard = self.page.lock().await;
            let page = guard
                .as_ref()
                .ok_or_else(|| LynkeusError::SessionError("session already closed".to_string()))?;
            page.goto(url)
                .await
                .map_err(|e| LynkeusError::NavigationError(format!("{url}: {e}")))?;
        }
        self.wait_for_quiescence().await;
        Ok(())
    }

    async fn find_target(
        page: &Page,
        selectors: &[Vec<String>],
    ) -> Result<chromiumoxide::Element> {
        let target = resolve_selector(selectors)
            .ok_or_else(|| LynkeusError::ScriptError("step has no usable selector".to_string()))?;
        match &target {
            TargetSelector::XPath(xpath) => page.find_xpath(xpath.as_str()).await,
            TargetSelector::Css(css) => page.find_element(css.as_str()).await,
        }
        .map_err(|e| LynkeusError::NavigationError(format!("element lookup failed: {e}")))
    }

    async fn click_target(&self, selectors: &[Vec<String>], clicks: u32) -> Result<()> {
        {
            let guard = self.page.lock().await;
            let page = guard
                .as_ref()
                .ok_or_else(|| LynkeusError::SessionError("session already closed".to_string()))?;
            let element = Self::find_target(page, selectors).await?;
            for _ in 0..clicks {
                element
                    .click()
                    .await
                    .map_err(|e| LynkeusError::NavigationError(format!("click failed: {e}")))?;
            }
        }
        self.wait_for_quiescence().await;
        Ok(())
    }

    async fn type_into(&self, selectors: &[Vec<String>], value: &str) -> Result<()> {
        let guard = self.page.lock().await;
        let page = guard
            .as_ref()
            .ok_or_else(|| LynkeusError::SessionError("session already closed".to_string()))?;
        let element = Self::find_target(page, selectors).await?;
        element
            .click()
            .await
            .map_err(|e| LynkeusError::NavigationError(format!("focus failed: {e}")))?;
        element
            .type_str(value)
            .await
            .map_err(|e| LynkeusError::NavigationError(format!("typing failed: {e}")))?;
        Ok(())
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl SessionDriver for ChromiumSession {
    async fn navigate(
        &self,
        url: &str,
        events: &mpsc::UnboundedSender<ObservedResponse>,
    ) -> Result<()> {
        self.set_events(Some(events.clone()));
        let result = self.goto(url).await;
        self.set_events(None);
        result
    }

    async fn replay(
        &self,
        script: &RecordedScript,
        events: &mpsc::UnboundedSender<ObservedResponse>,
    ) -> Result<()> {
        self.set_events(Some(events.clone()));
        let result = self.replay_steps(script).await;
        self.set_events(None);
        result
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut tasks) = self.listener_tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let page = self.page.lock().await.take();
        if let Some(page) = page {
            page.close()
                .await
                .map_err(|e| LynkeusError::SessionError(format!("Tab close failed: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(feature = "browser")]
impl ChromiumSession {
    async fn replay_steps(&self, script: &RecordedScript) -> Result<()> {
        for step in &script.steps {
            match step {
                Step::Navigate { url } => self.goto(url).await?,
                Step::Change { value, selectors } => self.type_into(selectors, value).await?,
                Step::Click { selectors } => self.click_target(selectors, 1).await?,
                Step::DoubleClick { selectors } => self.click_target(selectors, 2).await?,
                // Accepted but inert
                Step::SetViewport { width, height } => {
                    debug!("Skipping setViewport step ({width}x{height})");
                }
                Step::KeyUp { key } | Step::KeyDown { key } => {
                    debug!("Skipping raw key step ({key})");
                }
            }
        }
        Ok(())
    }
}

/// Flattens CDP headers into the lowercased multimap. CDP joins repeated
/// headers (notably Set-Cookie) with newlines.
#[cfg(feature = "browser")]
fn convert_headers(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    let value = match serde_json::to_value(headers) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unreadable response headers: {e}");
            return map;
        }
    };
    if let Some(object) = value.as_object() {
        for (name, raw) in object {
            if let Some(joined) = raw.as_str() {
                let entry = map.entry(name.to_ascii_lowercase()).or_default();
                for line in joined.split('\n') {
                    if !line.is_empty() {
                        entry.push(line.to_string());
                    }
                }
            }
        }
    }
    map
}

/// Stub used when the `browser` feature is not enabled
#[cfg(not(feature = "browser"))]
pub struct ChromiumFactory;

#[cfg(not(feature = "browser"))]
impl ChromiumFactory {
    pub fn new(
        _headers: std::collections::HashMap<String, String>,
        _local_storage: Vec<crate::models::StorageItem>,
    ) -> crate::error::Result<Self> {
        Err(crate::error::LynkeusError::ConfigError(
            "The Chromium backend requires the 'browser' feature. \
             Compile with: cargo build --features browser"
                .to_string(),
        ))
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait::async_trait]
impl crate::session::SessionFactory for ChromiumFactory {
    async fn create(&self) -> crate::error::Result<std::sync::Arc<dyn crate::session::SessionDriver>> {
        Err(crate::error::LynkeusError::ConfigError(
            "Chromium backend unavailable without the 'browser' feature".to_string(),
        ))
    }
}

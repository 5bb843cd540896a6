//! [`PageAdapter`]: navigation, screenshots, evaluation, and DOM interaction
//! atop a [`CdpMux`] (§4.5 "PageAdapter").

use std::time::Duration;
use std::time::Instant;

use base64::Engine as _;
use scdp_config::CdpDefaults;
use serde_json::Value;
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::trace;

use crate::cdp::mux::CdpEvent;
use crate::cdp::mux::CdpMux;

/// The wait-until state a navigation or reload should reach before
/// returning (§4.5 "Navigate").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitUntil {
    /// `Page.domContentEventFired` has fired.
    DomContentLoaded,
    /// `Page.loadEventFired` has fired.
    Load,
    /// No `Network.*` event has arrived for the configured quiet period.
    NetworkIdle,
}

/// The image format for [`PageAdapter::screenshot`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// PNG (lossless).
    Png,
    /// JPEG (`quality` applies).
    Jpeg,
    /// WebP (`quality` applies).
    Webp,
}

impl ImageFormat {
    fn as_cdp_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
        }
    }
}

/// Options for [`PageAdapter::navigate`]/[`PageAdapter::reload`].
#[derive(Clone, Copy, Debug)]
pub struct NavigateOptions {
    /// The wait-state to reach before returning.
    pub wait_until: WaitUntil,
    /// The maximum time to wait.
    pub timeout: Duration,
}

/// Options for [`PageAdapter::screenshot`].
#[derive(Clone, Copy, Debug)]
pub struct ScreenshotOptions {
    /// The image format.
    pub format: ImageFormat,
    /// The compression quality, for `jpeg`/`webp` only.
    pub quality: Option<u8>,
    /// Capture the full scrollable page rather than the viewport.
    pub full_page: bool,
}

/// An error from [`PageAdapter`].
#[derive(Debug, Error)]
pub enum Error {
    /// `Page.navigate` reported a navigation failure.
    #[error("page/nav-failed: {0}")]
    NavFailed(String),
    /// A navigation wait-state was not reached before the timeout.
    #[error("page/nav-timeout: did not reach the requested wait state within {0:?}")]
    NavTimeout(Duration),
    /// `Runtime.evaluate` reported an exception.
    #[error("page/eval-failed: {0}")]
    EvalFailed(String),
    /// The underlying CDP transport failed.
    #[error(transparent)]
    Cdp(#[from] crate::cdp::mux::Error),
    /// The screenshot body was not valid base64.
    #[error("invalid screenshot encoding: {0}")]
    InvalidScreenshot(#[from] base64::DecodeError),
}

/// A `Result` specialized to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Drives `Page`/`Runtime`/`DOM` domains of a single CDP target (§4.5).
pub struct PageAdapter {
    cdp: CdpMux,
    defaults: CdpDefaults,
}

impl PageAdapter {
    /// Constructs a new adapter and enables the required domains
    /// (§4.5 "Enable step").
    pub async fn new(cdp: CdpMux, defaults: CdpDefaults) -> Result<Self> {
        let adapter = Self { cdp, defaults };
        adapter.enable().await?;
        Ok(adapter)
    }

    async fn enable(&self) -> Result<()> {
        let (page, runtime, dom) = tokio::join!(
            self.cdp.send("Page.enable", json!({})),
            self.cdp.send("Runtime.enable", json!({})),
            self.cdp.send("DOM.enable", json!({})),
        );
        page?;
        runtime?;
        dom?;
        Ok(())
    }

    /// Navigates to `url`, then waits for the requested state
    /// (§4.5 "Navigate").
    pub async fn navigate(&self, url: &str, options: NavigateOptions) -> Result<()> {
        // Subscribe *before* sending the navigate command so no event in
        // between is missed.
        let events = self.cdp.subscribe();

        let result = self.cdp.send("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = result.get("errorText").and_then(|v| v.as_str()) {
            return Err(Error::NavFailed(error_text.to_string()));
        }

        self.wait_for(events, options).await
    }

    /// Reloads the current page, then waits for the requested state.
    ///
    /// Per the REDESIGN FLAG applied in §9: unlike the source (which only
    /// promotes `load`), `reload` accepts the same `waitUntil` options as
    /// `navigate`.
    pub async fn reload(&self, options: NavigateOptions) -> Result<()> {
        let events = self.cdp.subscribe();
        self.cdp.send("Page.reload", json!({})).await?;
        self.wait_for(events, options).await
    }

    /// Waits for `options.wait_until`, scoped to this single call: the
    /// subscription (and the RAII guard around its removal) is dropped when
    /// this function returns, whether by success or timeout — the Open
    /// Question resolution in §9 ("idle waiters are scoped and removed on
    /// completion or timeout").
    async fn wait_for(
        &self,
        mut events: tokio::sync::broadcast::Receiver<CdpEvent>,
        options: NavigateOptions,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + options.timeout;

        match options.wait_until {
            WaitUntil::DomContentLoaded => {
                wait_for_event(&mut events, "Page.domContentEventFired", deadline).await
            }
            WaitUntil::Load => wait_for_event(&mut events, "Page.loadEventFired", deadline).await,
            WaitUntil::NetworkIdle => {
                self.wait_for_network_idle(&mut events, deadline).await
            }
        }
        .ok_or(Error::NavTimeout(options.timeout))
    }

    /// Waits until no `Network.*` event has arrived for
    /// `self.defaults.networkidle_quiet_ms`, bounded by `deadline`.
    async fn wait_for_network_idle(
        &self,
        events: &mut tokio::sync::broadcast::Receiver<CdpEvent>,
        deadline: tokio::time::Instant,
    ) -> Option<()> {
        let quiet = Duration::from_millis(self.defaults.networkidle_quiet_ms);
        let mut last_activity = Instant::now();

        loop {
            let remaining_to_quiet = quiet.saturating_sub(last_activity.elapsed());
            let remaining_to_deadline = deadline.saturating_duration_since(tokio::time::Instant::now());

            if remaining_to_deadline.is_zero() {
                return None;
            }

            if remaining_to_quiet.is_zero() {
                return Some(());
            }

            let wait = remaining_to_quiet.min(remaining_to_deadline);
            match tokio::time::timeout(wait, events.recv()).await {
                Ok(Ok(event)) if event.method.starts_with("Network.") => {
                    last_activity = Instant::now();
                }
                Ok(Ok(_)) => continue,
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => return None,
                Err(_) => {
                    // The quiet-period timer elapsed without new traffic.
                    continue;
                }
            }
        }
    }

    /// Navigates back one history entry, or no-ops if there is none
    /// (§4.5 "History").
    pub async fn back(&self, timeout: Duration) -> Result<()> {
        self.navigate_history(-1, timeout).await
    }

    /// Navigates forward one history entry, or no-ops if there is none.
    pub async fn forward(&self, timeout: Duration) -> Result<()> {
        self.navigate_history(1, timeout).await
    }

    async fn navigate_history(&self, direction: i64, timeout: Duration) -> Result<()> {
        let history = self.cdp.send("Page.getNavigationHistory", json!({})).await?;
        let current_index = history.get("currentIndex").and_then(Value::as_i64).unwrap_or(0);
        let entries = history.get("entries").and_then(Value::as_array).cloned().unwrap_or_default();

        let target_index = current_index + direction;
        let Some(entry) = entries.get(usize::try_from(target_index).unwrap_or(usize::MAX)) else {
            return Ok(());
        };

        let Some(entry_id) = entry.get("id").and_then(Value::as_i64) else {
            return Ok(());
        };

        let events = self.cdp.subscribe();
        self.cdp
            .send("Page.navigateToHistoryEntry", json!({ "entryId": entry_id }))
            .await?;

        self.wait_for(
            events,
            NavigateOptions {
                wait_until: WaitUntil::Load,
                timeout,
            },
        )
        .await
    }

    /// Captures a screenshot (§4.5 "Screenshot").
    pub async fn screenshot(&self, options: ScreenshotOptions) -> Result<Vec<u8>> {
        let mut params = json!({ "format": options.format.as_cdp_str() });

        if matches!(options.format, ImageFormat::Jpeg | ImageFormat::Webp) {
            if let Some(quality) = options.quality {
                params["quality"] = json!(quality);
            }
        }

        if options.full_page {
            let metrics = self.cdp.send("Page.getLayoutMetrics", json!({})).await?;
            let content_size = metrics.get("contentSize").cloned().unwrap_or(json!({
                "width": 0,
                "height": 0,
            }));
            let width = content_size.get("width").cloned().unwrap_or(json!(0));
            let height = content_size.get("height").cloned().unwrap_or(json!(0));

            params["clip"] = json!({
                "x": 0,
                "y": 0,
                "width": width,
                "height": height,
                "scale": 1,
            });
            params["captureBeyondViewport"] = json!(true);
        }

        let result = self.cdp.send("Page.captureScreenshot", params).await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let bytes = base64::engine::general_purpose::STANDARD.decode(data)?;
        Ok(bytes)
    }

    /// Evaluates `expression` and returns its value (§4.5 "Evaluate").
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .cdp
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .get("exception")
                .and_then(|e| e.get("description"))
                .and_then(Value::as_str)
                .or_else(|| exception.get("text").and_then(Value::as_str))
                .unwrap_or("unknown evaluation error")
                .to_string();
            return Err(Error::EvalFailed(text));
        }

        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Sets the viewport size and device scale factor.
    pub async fn set_viewport(&self, width: u32, height: u32, device_scale_factor: f64) -> Result<()> {
        self.cdp
            .send(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": width,
                    "height": height,
                    "deviceScaleFactor": device_scale_factor,
                    "mobile": false,
                }),
            )
            .await?;
        Ok(())
    }

    /// Dispatches a mouse click at `(x, y)`.
    pub async fn click(&self, x: f64, y: f64) -> Result<()> {
        for event_type in ["mousePressed", "mouseReleased"] {
            self.cdp
                .send(
                    "Input.dispatchMouseEvent",
                    json!({
                        "type": event_type,
                        "x": x,
                        "y": y,
                        "button": "left",
                        "clickCount": 1,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Types `text` as a sequence of key events into the focused element.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        for ch in text.chars() {
            self.cdp
                .send(
                    "Input.dispatchKeyEvent",
                    json!({ "type": "char", "text": ch.to_string() }),
                )
                .await?;
        }
        Ok(())
    }

    /// Queries the document for the first element matching `selector`.
    pub async fn query_selector(&self, selector: &str) -> Result<Option<i64>> {
        let document = self.cdp.send("DOM.getDocument", json!({})).await?;
        let root_id = document
            .get("root")
            .and_then(|r| r.get("nodeId"))
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let result = self
            .cdp
            .send(
                "DOM.querySelector",
                json!({ "nodeId": root_id, "selector": selector }),
            )
            .await?;

        let node_id = result.get("nodeId").and_then(Value::as_i64).unwrap_or(0);
        Ok((node_id != 0).then_some(node_id))
    }

    /// Polls [`Self::query_selector`] every
    /// `self.defaults.selector_poll_interval_ms` until it matches or
    /// `timeout` elapses (§4.5 "waitForSelector").
    pub async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<i64> {
        let deadline = tokio::time::Instant::now() + timeout;
        let interval = Duration::from_millis(self.defaults.selector_poll_interval_ms);

        loop {
            if let Some(node_id) = self.query_selector(selector).await? {
                return Ok(node_id);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::NavTimeout(timeout));
            }

            tokio::time::sleep(interval).await;
        }
    }
}

/// Waits for a single occurrence of `method` on `events`, bounded by
/// `deadline`. Returns `None` on timeout or a closed channel.
async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<CdpEvent>,
    method: &str,
    deadline: tokio::time::Instant,
) -> Option<()> {
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if event.method == method => {
                trace!(method, "navigation wait state reached");
                return Some(());
            }
            Ok(Ok(_)) => continue,
            Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => return None,
            Err(_) => return None,
        }
    }
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            wait_until: WaitUntil::Load,
            timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_event_times_out_with_no_matching_event() {
        let (tx, mut rx) = tokio::sync::broadcast::channel(8);
        tx.send(CdpEvent {
            method: "Page.domContentEventFired".into(),
            params: Value::Null,
        })
        .ok();

        let deadline = tokio::time::Instant::now() + Duration::from_millis(50);
        let result = wait_for_event(&mut rx, "Page.loadEventFired", deadline).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn wait_for_event_resolves_on_matching_event() {
        let (tx, mut rx) = tokio::sync::broadcast::channel(8);
        tx.send(CdpEvent {
            method: "Page.loadEventFired".into(),
            params: Value::Null,
        })
        .ok();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let result = wait_for_event(&mut rx, "Page.loadEventFired", deadline).await;
        assert!(result.is_some());
    }
}

//! [`NetworkRecorder`]: tracks `Network.*` CDP events and exports them as a
//! HAR v1.2 log (§4.6 "NetworkRecorder").

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use scdp_events::NetworkEvent;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::cdp::mux::CdpMux;

/// The buffer sizes passed to `Network.enable` (§4.6).
const MAX_TOTAL_BUFFER_SIZE: u64 = 10_000_000;
const MAX_RESOURCE_BUFFER_SIZE: u64 = 5_000_000;

/// One request/response pair tracked by the recorder, keyed by CDP
/// `requestId`.
#[derive(Clone, Debug, Default)]
struct Entry {
    url: String,
    method: String,
    request_headers: Vec<(String, String)>,
    post_data: Option<String>,
    wall_time: f64,
    has_response: bool,
    status: u16,
    status_text: String,
    response_headers: Vec<(String, String)>,
    mime_type: String,
    http_version: String,
    encoded_data_length: f64,
    response_body: Option<String>,
    finished: bool,
    failed: Option<String>,
    request_timestamp: f64,
    finish_timestamp: f64,
}

/// Records `Network.*` traffic on a [`CdpMux`] and exports it as HAR
/// (§4.6). Entries preserve request order (backed by an [`IndexMap`]).
pub struct NetworkRecorder {
    cdp: CdpMux,
    entries: Arc<Mutex<IndexMap<String, Entry>>>,
    recording: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<NetworkEvent>,
}

impl NetworkRecorder {
    /// Constructs a recorder over `cdp`. Recording does not begin until
    /// [`Self::start`] is called.
    pub fn new(cdp: CdpMux) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            cdp,
            entries: Arc::new(Mutex::new(IndexMap::new())),
            recording: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            events,
        }
    }

    /// Subscribes to [`NetworkEvent`]s as requests finish or fail.
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Enables `Network` domain events and begins recording. A no-op if
    /// already recording.
    pub async fn start(&self) -> crate::cdp::mux::Result<()> {
        if self.recording.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.cdp
            .send(
                "Network.enable",
                serde_json::json!({
                    "maxTotalBufferSize": MAX_TOTAL_BUFFER_SIZE,
                    "maxResourceBufferSize": MAX_RESOURCE_BUFFER_SIZE,
                }),
            )
            .await?;

        let mut cdp_events = self.cdp.subscribe();
        let entries = self.entries.clone();
        let recording = self.recording.clone();
        let cdp = self.cdp.clone();
        let network_events = self.events.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = match cdp_events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                if !recording.load(Ordering::SeqCst) {
                    continue;
                }

                if !event.method.starts_with("Network.") {
                    continue;
                }

                let request_id = event.params.get("requestId").and_then(Value::as_str).map(str::to_string);

                {
                    let mut entries = entries.lock().await;
                    handle_event(&mut entries, &event.method, &event.params);
                }

                let Some(request_id) = request_id else {
                    continue;
                };

                match event.method.as_str() {
                    "Network.loadingFinished" => {
                        if let Ok(body) = cdp
                            .send(
                                "Network.getResponseBody",
                                serde_json::json!({ "requestId": &request_id }),
                            )
                            .await
                        {
                            let text = body.get("body").and_then(Value::as_str).map(str::to_string);
                            if let Some(text) = text {
                                let mut entries = entries.lock().await;
                                if let Some(entry) = entries.get_mut(&request_id) {
                                    entry.response_body = Some(text);
                                }
                            }
                        }

                        let _ = network_events.send(NetworkEvent::RequestFinished { request_id });
                    }
                    "Network.loadingFailed" => {
                        let _ = network_events.send(NetworkEvent::RequestFailed {
                            request_id: request_id.clone(),
                        });
                        let _ = network_events.send(NetworkEvent::RequestFinished { request_id });
                    }
                    _ => {}
                }
            }
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Disables `Network` domain events and stops recording. Entries
    /// already captured are retained.
    pub async fn stop(&self) -> crate::cdp::mux::Result<()> {
        if !self.recording.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }

        self.cdp.send("Network.disable", serde_json::json!({})).await?;
        Ok(())
    }

    /// Returns `true` iff the recorder is currently capturing events.
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Clears all captured entries without stopping recording.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// Exports everything captured so far as a HAR v1.2 document
    /// (§4.6 "HAR export").
    pub async fn export_har(&self) -> Har {
        let entries = self.entries.lock().await;
        let har_entries = entries
            .values()
            .filter(|entry| entry.has_response)
            .map(entry_to_har)
            .collect();

        Har {
            log: HarLog {
                version: "1.2".to_string(),
                creator: HarCreator {
                    name: "scdp".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
                entries: har_entries,
            },
        }
    }
}

/// Updates `entries` in response to one `Network.*` event.
fn handle_event(entries: &mut IndexMap<String, Entry>, method: &str, params: &Value) {
    let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
        return;
    };

    match method {
        "Network.requestWillBeSent" => {
            let request = params.get("request").cloned().unwrap_or(Value::Null);
            let entry = entries.entry(request_id.to_string()).or_default();
            entry.url = request.get("url").and_then(Value::as_str).unwrap_or_default().to_string();
            entry.method = request.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
            entry.request_headers = headers_from(request.get("headers"));
            entry.post_data = request.get("postData").and_then(Value::as_str).map(str::to_string);
            entry.wall_time = params.get("wallTime").and_then(Value::as_f64).unwrap_or(0.0);
            entry.request_timestamp = params.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
            trace!(request_id, url = %entry.url, "request observed");
        }
        "Network.responseReceived" => {
            let Some(entry) = entries.get_mut(request_id) else {
                return;
            };
            let response = params.get("response").cloned().unwrap_or(Value::Null);
            entry.has_response = true;
            entry.status = response.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
            entry.status_text = response
                .get("statusText")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            entry.response_headers = headers_from(response.get("headers"));
            entry.mime_type = response
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            entry.http_version = response
                .get("protocol")
                .and_then(Value::as_str)
                .unwrap_or("http/1.1")
                .to_string();
        }
        "Network.loadingFinished" => {
            let Some(entry) = entries.get_mut(request_id) else {
                return;
            };
            entry.finished = true;
            entry.encoded_data_length = params.get("encodedDataLength").and_then(Value::as_f64).unwrap_or(0.0);
            entry.finish_timestamp = params.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
        }
        "Network.loadingFailed" => {
            let Some(entry) = entries.get_mut(request_id) else {
                return;
            };
            entry.failed = Some(
                params
                    .get("errorText")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown network error")
                    .to_string(),
            );
            entry.finish_timestamp = params.get("timestamp").and_then(Value::as_f64).unwrap_or(0.0);
        }
        _ => {}
    }
}

/// Derives a `postData.mimeType` from a request's `content-type` header
/// (case-insensitive), defaulting to `application/octet-stream`.
fn request_content_type(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.clone())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn headers_from(headers: Option<&Value>) -> Vec<(String, String)> {
    let Some(object) = headers.and_then(Value::as_object) else {
        return Vec::new();
    };

    object
        .iter()
        .map(|(name, value)| (name.clone(), value.as_str().unwrap_or_default().to_string()))
        .collect()
}

fn entry_to_har(entry: &Entry) -> HarEntry {
    let started: DateTime<Utc> = DateTime::from_timestamp(
        entry.wall_time.trunc() as i64,
        (entry.wall_time.fract() * 1_000_000_000.0) as u32,
    )
    .unwrap_or_else(Utc::now);

    let elapsed_ms = ((entry.finish_timestamp - entry.request_timestamp).max(0.0)) * 1000.0;

    HarEntry {
        started_date_time: started.to_rfc3339(),
        time: elapsed_ms,
        request: HarRequest {
            method: entry.method.clone(),
            url: entry.url.clone(),
            http_version: entry.http_version.clone(),
            headers: entry
                .request_headers
                .iter()
                .map(|(name, value)| HarHeader {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            query_string: Vec::new(),
            headers_size: -1,
            body_size: entry.post_data.as_ref().map(|body| body.len() as i64).unwrap_or(0),
            post_data: entry.post_data.as_ref().map(|body| HarPostData {
                mime_type: request_content_type(&entry.request_headers),
                text: body.clone(),
            }),
        },
        response: HarResponse {
            status: entry.status,
            status_text: entry.status_text.clone(),
            http_version: entry.http_version.clone(),
            headers: entry
                .response_headers
                .iter()
                .map(|(name, value)| HarHeader {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            content: HarContent {
                size: entry.encoded_data_length as i64,
                mime_type: entry.mime_type.clone(),
                text: entry.response_body.clone(),
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: entry.encoded_data_length as i64,
        },
        cache: serde_json::json!({}),
        timings: HarTimings {
            send: 0.0,
            wait: elapsed_ms,
            receive: 0.0,
        },
        error: entry.failed.clone(),
    }
}

/// The top-level HAR document (`{ "log": { ... } }`).
#[derive(Clone, Debug, Serialize)]
pub struct Har {
    /// The HAR log body.
    pub log: HarLog,
}

/// A HAR v1.2 `log` object.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarLog {
    /// The HAR format version (`"1.2"`).
    pub version: String,
    /// The tool that produced this log.
    pub creator: HarCreator,
    /// The recorded request/response pairs, in capture order.
    pub entries: Vec<HarEntry>,
}

/// The HAR `creator` object.
#[derive(Clone, Debug, Serialize)]
pub struct HarCreator {
    /// The producing tool's name.
    pub name: String,
    /// The producing tool's version.
    pub version: String,
}

/// One HAR `entries[]` element.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    /// RFC 3339 timestamp of the request's start.
    pub started_date_time: String,
    /// Total elapsed time, in milliseconds.
    pub time: f64,
    /// The request.
    pub request: HarRequest,
    /// The response.
    pub response: HarResponse,
    /// Cache information (always empty; caching is not modeled).
    pub cache: Value,
    /// A breakdown of `time` into phases.
    pub timings: HarTimings,
    /// A network-level error, if the request failed before completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A HAR `request` object.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    /// The HTTP method.
    pub method: String,
    /// The request URL.
    pub url: String,
    /// The HTTP version string.
    pub http_version: String,
    /// The request headers.
    pub headers: Vec<HarHeader>,
    /// Parsed query-string parameters (not populated; see
    /// [`HarRequest::url`]).
    pub query_string: Vec<HarHeader>,
    /// The size of the request headers, in bytes, or `-1` if unknown.
    pub headers_size: i64,
    /// The size of the request body, in bytes.
    pub body_size: i64,
    /// The request body, if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
}

/// A HAR `postData` object.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    /// The body's MIME type.
    pub mime_type: String,
    /// The body, as text.
    pub text: String,
}

/// A HAR `response` object.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    /// The HTTP status code.
    pub status: u16,
    /// The HTTP status line text.
    pub status_text: String,
    /// The HTTP version string.
    pub http_version: String,
    /// The response headers.
    pub headers: Vec<HarHeader>,
    /// The response body metadata.
    pub content: HarContent,
    /// The redirect target, if any (not populated).
    pub redirect_url: String,
    /// The size of the response headers, in bytes, or `-1` if unknown.
    pub headers_size: i64,
    /// The size of the response body, in bytes.
    pub body_size: i64,
}

/// A HAR `content` object.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    /// The body size, in bytes.
    pub size: i64,
    /// The body's MIME type.
    pub mime_type: String,
    /// The body text, if fetched via `Network.getResponseBody` (absent for
    /// responses where the fetch 404s, e.g. 204s and redirects).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A single HAR header entry.
#[derive(Clone, Debug, Serialize)]
pub struct HarHeader {
    /// The header name.
    pub name: String,
    /// The header value.
    pub value: String,
}

/// A HAR `timings` object, in milliseconds. Phases this recorder cannot
/// distinguish (`blocked`, `dns`, `connect`, `ssl`) are omitted rather than
/// guessed.
#[derive(Clone, Debug, Serialize)]
pub struct HarTimings {
    /// Time spent sending the request.
    pub send: f64,
    /// Time spent waiting for the first response byte.
    pub wait: f64,
    /// Time spent reading the response body.
    pub receive: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_will_be_sent_then_response_received_populates_entry() {
        let mut entries = IndexMap::new();

        handle_event(
            &mut entries,
            "Network.requestWillBeSent",
            &serde_json::json!({
                "requestId": "1",
                "timestamp": 100.0,
                "wallTime": 1700000000.0,
                "request": { "url": "https://example.com", "method": "GET", "headers": { "Accept": "*/*" } },
            }),
        );

        handle_event(
            &mut entries,
            "Network.responseReceived",
            &serde_json::json!({
                "requestId": "1",
                "response": { "status": 200, "statusText": "OK", "mimeType": "text/html", "headers": {} },
            }),
        );

        handle_event(
            &mut entries,
            "Network.loadingFinished",
            &serde_json::json!({ "requestId": "1", "timestamp": 100.2, "encodedDataLength": 512 }),
        );

        let entry = entries.get("1").unwrap();
        assert_eq!(entry.url, "https://example.com");
        assert_eq!(entry.status, 200);
        assert!(entry.finished);
    }

    #[test]
    fn loading_failed_records_the_error_text() {
        let mut entries = IndexMap::new();
        handle_event(
            &mut entries,
            "Network.requestWillBeSent",
            &serde_json::json!({
                "requestId": "2",
                "request": { "url": "https://example.com/x", "method": "GET", "headers": {} },
            }),
        );
        handle_event(
            &mut entries,
            "Network.loadingFailed",
            &serde_json::json!({ "requestId": "2", "errorText": "net::ERR_FAILED" }),
        );

        let entry = entries.get("2").unwrap();
        assert_eq!(entry.failed.as_deref(), Some("net::ERR_FAILED"));
    }

    #[test]
    fn entries_without_a_response_are_excluded_from_har_export() {
        let mut entries = IndexMap::new();
        handle_event(
            &mut entries,
            "Network.requestWillBeSent",
            &serde_json::json!({
                "requestId": "3",
                "request": { "url": "https://example.com/pending", "method": "GET", "headers": {} },
            }),
        );

        let har_entries: Vec<_> = entries.values().filter(|entry| entry.has_response).collect();
        assert!(har_entries.is_empty());
    }

    #[test]
    fn a_request_that_fails_before_any_response_has_no_response() {
        let mut entries = IndexMap::new();
        handle_event(
            &mut entries,
            "Network.requestWillBeSent",
            &serde_json::json!({
                "requestId": "4",
                "request": { "url": "https://example.com/aborted", "method": "GET", "headers": {} },
            }),
        );
        handle_event(
            &mut entries,
            "Network.loadingFailed",
            &serde_json::json!({ "requestId": "4", "errorText": "net::ERR_ABORTED" }),
        );

        let entry = entries.get("4").unwrap();
        assert!(!entry.has_response);
    }

    #[test]
    fn response_received_marks_has_response() {
        let mut entries = IndexMap::new();
        handle_event(
            &mut entries,
            "Network.requestWillBeSent",
            &serde_json::json!({
                "requestId": "5",
                "request": { "url": "https://example.com/ok", "method": "GET", "headers": {} },
            }),
        );
        handle_event(
            &mut entries,
            "Network.responseReceived",
            &serde_json::json!({
                "requestId": "5",
                "response": { "status": 200, "statusText": "OK", "mimeType": "text/html", "headers": {} },
            }),
        );

        assert!(entries.get("5").unwrap().has_response);
    }

    #[test]
    fn request_content_type_derives_post_data_mime_type() {
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        assert_eq!(request_content_type(&headers), "application/json");
    }

    #[test]
    fn request_content_type_defaults_when_header_absent() {
        assert_eq!(request_content_type(&[]), "application/octet-stream");
    }
}

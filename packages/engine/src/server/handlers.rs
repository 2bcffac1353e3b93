// packages/engine/src/server/handlers.rs
//! Request handlers
//!
//! Replies are JSON `{"errno":0}` on success and
//! `{"errno":1,"errmsg":"..."}` on failure, except for listings (raw blocks
//! or exported JSON), tail streams (JSON lines) and metrics (Prometheus text).

use crate::discrimination::{SessionMatcherCnf, TailRequest, TailSession};
use crate::recording::window;
use crate::recording::{ExportFormat, Exporter};
use crate::server::AppState;
use crate::utils::errors::EngineError;
use bytes::Bytes;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Frames buffered between a tail loop and its connection
const TAIL_BUFFER: usize = 16;

const DEFAULT_LIST_LIMIT: usize = 10;

#[derive(Serialize)]
struct Reply<'a> {
    errno: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    errmsg: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kept: Option<bool>,
}

impl<'a> Reply<'a> {
    fn ok() -> Self {
        Self {
            errno: 0,
            errmsg: None,
            kept: None,
        }
    }

    fn error(message: &'a str) -> Self {
        Self {
            errno: 1,
            errmsg: Some(message),
            kept: None,
        }
    }
}

fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).boxed_unsync()
}

fn respond(status: StatusCode, content_type: &'static str, body: ResponseBody) -> Response<ResponseBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn reply(status: StatusCode, reply: &Reply<'_>) -> Response<ResponseBody> {
    let body = serde_json::to_vec(reply).unwrap_or_default();
    respond(status, "application/json", full(body))
}

fn bad_request(message: impl Display) -> Response<ResponseBody> {
    reply(StatusCode::BAD_REQUEST, &Reply::error(&message.to_string()))
}

fn error_response(err: &EngineError) -> Response<ResponseBody> {
    let status = match err {
        EngineError::QueueOverflow | EngineError::TailerOverflow { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::ConfigInvalid(_)
        | EngineError::PatternCompile { .. }
        | EngineError::Parse(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    reply(status, &Reply::error(&err.to_string()))
}

async fn read_body<B>(body: B) -> Result<Bytes, Response<ResponseBody>>
where
    B: Body,
    B::Error: Display,
{
    match body.collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(bad_request(format!("failed to read body: {}", e))),
    }
}

/// Dispatch one request
pub async fn route(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Result<Response<ResponseBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    debug!("{} {}", method, path);

    let response = match (method, path.as_str()) {
        (Method::POST, "/add-event") => match read_body(req.into_body()).await {
            Ok(body) => add_event(&state, body),
            Err(response) => response,
        },
        (Method::GET, "/list-events") => list_events(&state, &query).await,
        (Method::POST, "/update-session-matcher") => match read_body(req.into_body()).await {
            Ok(body) => update_session_matcher(&state, &body),
            Err(response) => response,
        },
        (Method::POST, "/tail") => match read_body(req.into_body()).await {
            Ok(body) => tail(&state, &body),
            Err(response) => response,
        },
        (Method::GET, "/metrics") => metrics(&state),
        _ => reply(StatusCode::NOT_FOUND, &Reply::error("not found")),
    };
    Ok(response)
}

/// Discriminate (when enabled) and enqueue one session
pub fn add_event(state: &AppState, body: Bytes) -> Response<ResponseBody> {
    let mut outcome = Reply::ok();
    if state.discriminate_on_ingest {
        let scene = state.discriminator.lock().scene_of(&body);
        if scene.is_none() {
            outcome.kept = Some(false);
            return reply(StatusCode::OK, &outcome);
        }
        outcome.kept = Some(true);
    }

    match state.store.add(body) {
        Ok(()) => reply(StatusCode::OK, &outcome),
        Err(e) => {
            warn!("Rejected event: {}", e);
            error_response(&e)
        }
    }
}

/// Parsed `/list-events` query
#[derive(Debug, Clone, PartialEq)]
struct ListParams {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    skip: usize,
    limit: usize,
    format: Option<ExportFormat>,
}

impl ListParams {
    fn parse(query: &str, offset: FixedOffset, now: DateTime<Utc>) -> Result<Self, String> {
        let mut start = None;
        let mut end = None;
        let mut params = Self {
            start: now,
            end: now,
            skip: 0,
            limit: DEFAULT_LIST_LIMIT,
            format: None,
        };

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "startTime" => start = Some(parse_stamp(key, value, offset)?),
                "endTime" => end = Some(parse_stamp(key, value, offset)?),
                "skip" => params.skip = parse_count(key, value)?,
                "limit" => params.limit = parse_count(key, value)?,
                "format" => {
                    params.format = match value {
                        "" | "binary" => None,
                        other => Some(
                            ExportFormat::parse(other)
                                .ok_or_else(|| format!("unknown format {:?}", other))?,
                        ),
                    }
                }
                _ => {}
            }
        }

        params.end = end.unwrap_or(now);
        params.start = start.unwrap_or(params.end - Duration::hours(1));
        Ok(params)
    }
}

fn parse_stamp(key: &str, value: &str, offset: FixedOffset) -> Result<DateTime<Utc>, String> {
    window::parse_stamp(value, offset)
        .ok_or_else(|| format!("{} must be a YYYYMMDDhhmm stamp, got {:?}", key, value))
}

fn parse_count(key: &str, value: &str) -> Result<usize, String> {
    value
        .parse()
        .map_err(|_| format!("{} must be a non-negative integer, got {:?}", key, value))
}

/// List blocks in a time range, as raw blocks or exported JSON
pub async fn list_events(state: &AppState, query: &str) -> Response<ResponseBody> {
    let offset = state.store.naming_offset();
    let params = match ListParams::parse(query, offset, state.store.now()) {
        Ok(params) => params,
        Err(message) => return bad_request(message),
    };

    let store = state.store.clone();
    let (start, end, skip, limit) = (params.start, params.end, params.skip, params.limit);
    let listed = tokio::task::spawn_blocking(move || store.list(start, end, skip, limit)).await;
    let blocks = match listed {
        Ok(Ok(blocks)) => blocks,
        Ok(Err(e)) => {
            error!("Failed to list events: {}", e);
            return error_response(&e);
        }
        Err(e) => {
            error!("List task failed: {}", e);
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                &Reply::error("list task failed"),
            );
        }
    };

    match params.format {
        None => respond(
            StatusCode::OK,
            "application/octet-stream",
            full(blocks.into_bytes()),
        ),
        Some(format) => match Exporter::new(format, offset).export(&blocks) {
            Ok(exported) => respond(StatusCode::OK, format.content_type(), full(exported)),
            Err(e) => {
                error!("Failed to export events: {}", e);
                error_response(&e)
            }
        },
    }
}

/// Replace the matcher of one session type
pub fn update_session_matcher(state: &AppState, body: &[u8]) -> Response<ResponseBody> {
    let cnf: SessionMatcherCnf = match serde_json::from_slice(body) {
        Ok(cnf) => cnf,
        Err(e) => return error_response(&EngineError::from(e)),
    };
    match state.matchers.update(&cnf) {
        Ok(()) => reply(StatusCode::OK, &Reply::ok()),
        Err(e) => {
            warn!("Rejected session matcher for {:?}: {}", cnf.session_type, e);
            error_response(&e)
        }
    }
}

/// Start a tail loop and stream its frames as JSON lines
pub fn tail(state: &AppState, body: &[u8]) -> Response<ResponseBody> {
    let request: TailRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return error_response(&EngineError::from(e)),
    };
    let session = match TailSession::new(
        Arc::clone(&state.tails),
        &request,
        state.discriminator_config.tail_idle_timeout(),
    ) {
        Ok(session) => session,
        Err(e) => return error_response(&e),
    };

    let (sink, frames) = mpsc::channel(TAIL_BUFFER);
    tokio::spawn(session.run(sink, state.shutdown.child_token()));

    let lines = futures::stream::unfold(frames, |mut frames| async move {
        let frame = frames.recv().await?;
        let mut line = serde_json::to_vec(&frame).unwrap_or_default();
        line.push(b'\n');
        Some((Ok::<_, Infallible>(Frame::data(Bytes::from(line))), frames))
    });
    respond(
        StatusCode::OK,
        "application/x-ndjson",
        StreamBody::new(lines).boxed_unsync(),
    )
}

/// Prometheus text exposition
pub fn metrics(state: &AppState) -> Response<ResponseBody> {
    match &state.metrics {
        Some(handle) => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            full(handle.render()),
        ),
        None => reply(StatusCode::NOT_FOUND, &Reply::error("metrics disabled")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discrimination::PassThroughDiscriminator;
    use crate::recording::{EventBlocks, Store, StoreConfig};
    use crate::utils::clock::MockClock;
    use crate::utils::config::EngineConfig;
    use tempfile::{tempdir, TempDir};

    const SESSION: &str = r#"{"CallFromInbound":{"Request":"\\x0bQREQUEST_URI/test\\x0c2DOCUMENT_URI"},"ReturnInbound":{"Response":"product_id=3&combo_type=1"},"Actions":[]}"#;

    const MATCHER: &str = r#"{"SessionType":"/test","KeepNSessionsPerScene":1,
        "InboundResponsePatterns":{"product_id":"product_id=(\\d+)"}}"#;

    fn state(queue_capacity: usize, discriminate: bool) -> (TempDir, AppState) {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.store = StoreConfig {
            root_dir: dir.path().to_path_buf(),
            queue_capacity,
            ..StoreConfig::default()
        };
        config.server.discriminate_on_ingest = discriminate;
        let clock = MockClock::at_unix(1_483_228_900);
        let store = Store::with_clock(config.store.clone(), Arc::new(clock)).unwrap();
        (dir, AppState::new(&config, store, None))
    }

    async fn body_of(response: Response<ResponseBody>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_add_event_discriminates() {
        let (_dir, state) = state(10, true);
        assert_eq!(
            update_session_matcher(&state, MATCHER.as_bytes()).status(),
            StatusCode::OK
        );

        let first = add_event(&state, Bytes::from_static(SESSION.as_bytes()));
        assert_eq!(&body_of(first).await[..], b"{\"errno\":0,\"kept\":true}");
        let second = add_event(&state, Bytes::from_static(SESSION.as_bytes()));
        assert_eq!(&body_of(second).await[..], b"{\"errno\":0,\"kept\":false}");

        assert_eq!(state.store.queue_stats().current_size, 1);
    }

    #[tokio::test]
    async fn test_add_event_overflow() {
        let (_dir, state) = state(1, false);
        let state = state.with_discriminator(Box::new(PassThroughDiscriminator));

        assert_eq!(add_event(&state, Bytes::from_static(b"1")).status(), StatusCode::OK);
        let rejected = add_event(&state, Bytes::from_static(b"2"));

        assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(&body_of(rejected).await).unwrap();
        assert_eq!(body["errno"], 1);
    }

    #[tokio::test]
    async fn test_update_session_matcher_rejects_bad_pattern() {
        let (_dir, state) = state(10, true);
        let bad = r#"{"SessionType":"/test","InboundRequestPatterns":{"k":"("}}"#;

        let response = update_session_matcher(&state, bad.as_bytes());

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.matchers.is_empty());
    }

    #[tokio::test]
    async fn test_list_events_formats() {
        let (_dir, state) = state(10, false);
        add_event(&state, Bytes::from_static(b"{\"url\":\"/hello\"}"));
        state.store.writer().flush_input_queue().unwrap();

        let raw = body_of(list_events(&state, "startTime=201701010800&endTime=201701010900").await).await;
        let blocks = EventBlocks::new(raw);
        let (id, _, _) = blocks.cursor().next().unwrap();
        assert_eq!(id.file_name, "201701010800");

        let response =
            list_events(&state, "startTime=201701010800&endTime=201701010900&format=json").await;
        let exported: serde_json::Value = serde_json::from_slice(&body_of(response).await).unwrap();
        assert_eq!(exported[0]["body"], "{\"url\":\"/hello\"}");
    }

    #[tokio::test]
    async fn test_list_events_bad_query() {
        let (_dir, state) = state(10, false);

        assert_eq!(
            list_events(&state, "startTime=yesterday").await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            list_events(&state, "limit=-1").await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            list_events(&state, "format=har").await.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_tail_streams_frames() {
        let (_dir, state) = state(10, true);
        let request = r#"{"limit":1,"matcher":{"InboundResponsePatterns":{"combo_type":"combo_type=(\\d+)"}}}"#;

        let response = tail(&state, request.as_bytes());
        assert_eq!(response.status(), StatusCode::OK);

        // no matcher registered: dropped by discrimination but still tailed
        for _ in 0..2 {
            while state.tails.pending("*") == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            add_event(&state, Bytes::from_static(SESSION.as_bytes()));
        }

        let body = body_of(response).await;
        let lines: Vec<serde_json::Value> = body
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        for line in &lines[..2] {
            assert_eq!(line["session_type"], "/test");
            assert_eq!(line["scene"]["combo_type"], "1");
        }
        assert_eq!(lines[2]["outcome"], "limit_reached");
        assert_eq!(state.tails.pending("*"), 0);
    }

    #[tokio::test]
    async fn test_tail_rejects_bad_matcher() {
        let (_dir, state) = state(10, true);
        let request = r#"{"matcher":{"InboundResponsePatterns":{"k":"no group"}}}"#;

        assert_eq!(tail(&state, request.as_bytes()).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_list_params_defaults() {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let now = DateTime::from_timestamp(1_483_228_900, 0).unwrap();

        let params = ListParams::parse("skip=2", offset, now).unwrap();

        assert_eq!(params.end, now);
        assert_eq!(params.start, now - Duration::hours(1));
        assert_eq!(params.skip, 2);
        assert_eq!(params.limit, DEFAULT_LIST_LIMIT);
        assert!(params.format.is_none());
    }

    #[test]
    fn test_metrics_disabled() {
        let (_dir, state) = state(10, false);
        assert_eq!(metrics(&state).status(), StatusCode::NOT_FOUND);
    }
}

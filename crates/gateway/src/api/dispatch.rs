//! Request dispatch: resolve the lambda, check policy, stream the child's
//! stdout as the response body and record the outcome.
//!
//! The response status is committed only after the first stdout bytes (or
//! completion without output), so spawn failures surface as 5xx instead of
//! a truncated 200.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};

use sp_domain::{Body as RequestBody, CapturedRequest, Error, Record};

use crate::platform::Definition;
use crate::state::AppState;

/// Size of the pre-flush probe: output beyond this point streams directly.
const PROBE_SIZE: usize = 1024;

pub async fn by_uid(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request,
) -> Response {
    let uid = params.get("uid").cloned().unwrap_or_default();
    let captured = match capture(&state, "/a/", req).await {
        Ok(captured) => captured,
        Err(e) => return error_response(e),
    };
    match state.registry.find_by_uid(&uid) {
        Ok(def) => invoke_sync(state, def, captured).await,
        Err(e) => {
            state
                .stats
                .track(Record::begin(&uid, captured).finish(Some(e.to_string())));
            error_response(e)
        }
    }
}

pub async fn by_alias(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request,
) -> Response {
    let alias = params.get("alias").cloned().unwrap_or_default();
    let captured = match capture(&state, "/l/", req).await {
        Ok(captured) => captured,
        Err(e) => return error_response(e),
    };
    match state.registry.find_by_link(&alias) {
        Ok(def) => invoke_sync(state, def, captured).await,
        Err(e) => {
            state
                .stats
                .track(Record::begin(&alias, captured).finish(Some(e.to_string())));
            error_response(e)
        }
    }
}

pub async fn enqueue(
    State(state): State<AppState>,
    Path(params): Path<HashMap<String, String>>,
    req: Request,
) -> Response {
    let queue = params.get("queue").cloned().unwrap_or_default();
    let captured = match capture(&state, "/q/", req).await {
        Ok(captured) => captured,
        Err(e) => return error_response(e),
    };
    let record = Record::begin(&queue, captured.clone());
    match state.queues.put(&queue, captured).await {
        Ok(()) => {
            state.stats.track(record.finish(None));
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            state.stats.track(record.finish(Some(e.to_string())));
            error_response(e)
        }
    }
}

/// Run the policy check and the lambda, streaming stdout into the
/// response. Failures after the first byte only truncate the stream.
async fn invoke_sync(state: AppState, def: Definition, captured: CapturedRequest) -> Response {
    let record = Record::begin(&def.uid, captured.clone());
    if let Err(e) = state.policies.inspect(&def.uid, &captured) {
        tracing::warn!(uid = %def.uid, error = %e, "request denied");
        state.stats.track(record.finish(Some(e.to_string())));
        return error_response(e);
    }

    let output_headers = def.manifest.output_headers.clone();
    let (mut reader, mut writer) = tokio::io::duplex(64 * 1024);
    let handle = {
        let cancel = state.cancel.clone();
        let stats = state.stats.clone();
        let env = state.registry.global_env();
        let lambda = def.lambda.clone();
        tokio::spawn(async move {
            let result = lambda.invoke(&cancel, captured, &mut writer, &env).await;
            drop(writer); // EOF for the response stream
            stats.track(record.finish(result.as_ref().err().map(|e| e.to_string())));
            result
        })
    };

    let mut probe = vec![0u8; PROBE_SIZE];
    let first = match reader.read(&mut probe).await {
        Ok(n) => n,
        Err(_) => 0,
    };

    if first == 0 {
        // the lambda finished without producing output (or failed before
        // producing any); the status can still tell the truth
        return match handle.await {
            Ok(Ok(())) => {
                let mut resp = StatusCode::OK.into_response();
                set_output_headers(&mut resp, &output_headers);
                resp
            }
            Ok(Err(e)) => error_response(e),
            Err(e) => error_response(Error::RuntimeFailure(format!("invocation panicked: {e}"))),
        };
    }

    probe.truncate(first);
    let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(probe)) })
        .chain(ReaderStream::new(reader));
    let mut resp = Response::new(Body::from_stream(stream));
    set_output_headers(&mut resp, &output_headers);
    resp
}

fn set_output_headers(resp: &mut Response, headers: &std::collections::BTreeMap<String, String>) {
    for (name, value) in headers {
        let Ok(name) = name.parse::<HeaderName>() else {
            tracing::warn!(header = %name, "skipping invalid output header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            tracing::warn!(header = %name, "skipping invalid output header value");
            continue;
        };
        resp.headers_mut().insert(name, value);
    }
}

fn error_response(e: Error) -> Response {
    let status = StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, e.to_string()).into_response()
}

/// Capture the HTTP request into the platform's request shape: the mount
/// prefix is stripped from the path, query (and urlencoded form) parameters
/// are flattened first-value-wins, and the body stays a stream unless it
/// had to be parsed as a form.
async fn capture(state: &AppState, mount: &str, req: Request) -> Result<CapturedRequest, Error> {
    let mut captured = CapturedRequest {
        method: req.method().as_str().to_string(),
        url: req.uri().to_string(),
        path: req
            .uri()
            .path()
            .strip_prefix(mount)
            .unwrap_or(req.uri().path())
            .to_string(),
        ..CapturedRequest::default()
    };

    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            captured
                .headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }

    captured.remote_address = client_address(state, &captured, req.extensions());

    if let Some(query) = req.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            captured
                .form
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }

    let is_form = captured
        .header("Content-Type")
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    let body = req.into_body();
    if is_form {
        // form bodies must be flattened into parameters; re-expose the raw
        // bytes as the body afterwards
        let bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| Error::BadRequest(format!("read form body: {e}")))?;
        for (key, value) in url::form_urlencoded::parse(&bytes) {
            captured.form.insert(key.into_owned(), value.into_owned());
        }
        captured.body = Some(RequestBody::new(std::io::Cursor::new(bytes.to_vec())));
    } else {
        let stream = body
            .into_data_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        captured.body = Some(RequestBody::new(StreamReader::new(stream)));
    }
    Ok(captured)
}

/// Peer address, optionally overridden by proxy headers.
fn client_address(
    state: &AppState,
    captured: &CapturedRequest,
    extensions: &axum::http::Extensions,
) -> String {
    if state.behind_proxy {
        if let Some(real) = captured.header("X-Real-Ip") {
            return real.trim().to_string();
        }
        if let Some(forwarded) = captured.header("X-Forwarded-For") {
            if let Some(first) = forwarded.split(',').next() {
                return first.trim().to_string();
            }
        }
    }
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_default()
}

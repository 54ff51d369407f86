use crate::fetch::{open_remote_blob, FetchRequest};
use crate::ingest::{spawn_replica_top_up, store_blob_stream};
use crate::node::NodeState;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use cbfs_lib::{
    BlobId, CbfsError, HASH_HEADER, KEEP_REVS_HEADER, OLDEST_REV_HEADER, PREVNODE_HEADER,
    RESERVED_PREFIX, REVNO_HEADER,
};
use cluster_meta::{
    delete_file_meta, forget_ownership, get_file_meta, get_ownership, list_file_metas,
    set_userdata, store_config, store_file_meta, touch_access, FileMeta, StoredHeaders,
};
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};

/// Referenced-within guard for raw blob DELETEs.
const DELETE_GUARD_SECS: u64 = 60 * 60;

pub fn build_router(state: NodeState) -> Router {
    Router::new()
        .route("/.cbfs/blob/", get(list_blobs).post(post_raw_blob))
        .route(
            "/.cbfs/blob/:oid",
            get(get_raw_blob).put(put_raw_blob).delete(delete_raw_blob),
        )
        .route("/.cbfs/nodes/", get(list_nodes))
        .route("/.cbfs/config/", get(get_config).put(put_config))
        .route("/.cbfs/meta/*path", get(get_meta).put(put_meta))
        .route("/.cbfs/fetch/*oid", get(fetch_blob))
        .route("/.cbfs/list/*path", get(list_docs))
        .fallback(user_file)
        .with_state(state)
}

struct ApiError(CbfsError);

type ApiResult = Result<Response, ApiError>;

impl From<CbfsError> for ApiError {
    fn from(err: CbfsError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CbfsError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CbfsError::NotFound(_) => StatusCode::NOT_FOUND,
            CbfsError::Gone(_) => StatusCode::GONE,
            CbfsError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

/// Strip leading slashes; empty and directory-shaped paths land on
/// index.html.
fn resolve_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        "index.html".to_string()
    } else if trimmed.ends_with('/') {
        format!("{}index.html", trimmed)
    } else {
        trimmed.to_string()
    }
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            Some(value.to_string())
        } else {
            None
        }
    })
}

fn http_date(secs: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_default()
}

fn rfc3339(secs: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs as i64, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Adapt an incoming request body into the AsyncRead the ingest
/// pipeline drains.
fn body_reader(req: Request) -> impl tokio::io::AsyncRead + Unpin {
    let stream = req.into_body().into_data_stream().map(|chunk| {
        chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    });
    StreamReader::new(stream)
}

fn stored_headers(headers: &axum::http::HeaderMap) -> StoredHeaders {
    let mut map = StoredHeaders::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

fn stored_content_type(stored: &StoredHeaders) -> Option<&str> {
    stored
        .get("content-type")
        .and_then(|values| values.first())
        .map(|v| v.as_str())
}

fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Insert a header by dynamic name (the X-CBFS-* family).
fn set_header(response: &mut Response, name: &str, value: &str) {
    if let Ok(name) = header::HeaderName::from_bytes(name.as_bytes()) {
        response.headers_mut().insert(name, header_value(value));
    }
}

/// Single `bytes=a-b` / `bytes=a-` / `bytes=-n` range against a known
/// total; anything fancier falls back to a full-body serve.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') || total == 0 {
        return None;
    }
    let (start_str, end_str) = spec.split_once('-')?;
    if start_str.is_empty() {
        let suffix: u64 = end_str.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        Some((total.saturating_sub(suffix), total - 1))
    } else {
        let start: u64 = start_str.parse().ok()?;
        if start >= total {
            return None;
        }
        let end = if end_str.is_empty() {
            total - 1
        } else {
            end_str.parse::<u64>().ok()?.min(total - 1)
        };
        if end < start {
            return None;
        }
        Some((start, end))
    }
}

/// Range-aware streaming serve of a local canonical blob.
async fn local_blob_response(
    state: &NodeState,
    oid: &BlobId,
    range_header: Option<&str>,
) -> Result<Response, CbfsError> {
    let total = state.store.length(oid).await?;
    let range = range_header.and_then(|value| parse_range(value, total));
    let response = match range {
        Some((start, end)) => {
            let (reader, _) = state.store.open(oid, start).await?;
            let body = Body::from_stream(ReaderStream::new(reader.take(end - start + 1)));
            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {}-{}/{}", start, end, total)),
            );
            response.headers_mut().insert(
                header::CONTENT_LENGTH,
                header_value(&(end - start + 1).to_string()),
            );
            response
        }
        None => {
            let (reader, _) = state.store.open(oid, 0).await?;
            let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, header_value(&total.to_string()));
            response
        }
    };
    Ok(response)
}

fn spawn_touch_access(state: &NodeState, oid: BlobId) {
    let meta = state.meta.clone();
    let node = state.node_name.clone();
    tokio::spawn(async move {
        if let Err(e) = touch_access(meta.as_ref(), &oid, &node).await {
            warn!("access record for {} failed: {}", oid, e);
        }
    });
}

// ---- raw blob endpoints ----

async fn list_blobs(State(state): State<NodeState>) -> ApiResult {
    let mut out = String::new();
    for id in state.store.walk().await? {
        out.push_str(&id.to_hex());
        out.push('\n');
    }
    Ok(out.into_response())
}

async fn post_raw_blob(State(state): State<NodeState>, req: Request) -> ApiResult {
    let mut reader = body_reader(req);
    let result = store_blob_stream(&state, &mut reader, None, false).await?;
    Ok((
        StatusCode::CREATED,
        [(HASH_HEADER, result.oid.to_hex())],
        Body::empty(),
    )
        .into_response())
}

async fn put_raw_blob(
    State(state): State<NodeState>,
    Path(oid): Path<String>,
    req: Request,
) -> ApiResult {
    let expected = BlobId::from_hex(&oid)?;
    let mut reader = body_reader(req);
    let result = store_blob_stream(&state, &mut reader, Some(expected), false).await?;
    Ok((
        StatusCode::CREATED,
        [(HASH_HEADER, result.oid.to_hex())],
        Body::empty(),
    )
        .into_response())
}

async fn get_raw_blob(
    State(state): State<NodeState>,
    Path(oid): Path<String>,
    req: Request,
) -> ApiResult {
    let id = BlobId::from_hex(&oid)?;
    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    match local_blob_response(&state, &id, range.as_deref()).await {
        Ok(mut response) => {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            spawn_touch_access(&state, id);
            Ok(response)
        }
        Err(e) if e.is_not_found() => {
            // We were listed as an owner but have nothing; reconcile.
            let meta = state.meta.clone();
            let node = state.node_name.clone();
            tokio::spawn(async move {
                let _ = forget_ownership(meta.as_ref(), &id, &node).await;
            });
            Err(ApiError(e))
        }
        Err(e) => Err(ApiError(e)),
    }
}

async fn delete_raw_blob(State(state): State<NodeState>, Path(oid): Path<String>) -> ApiResult {
    let id = BlobId::from_hex(&oid)?;

    if let Some(ownership) = get_ownership(state.meta.as_ref(), &id).await? {
        if let Some((node, time)) = ownership.most_recent() {
            if cbfs_lib::unix_timestamp().saturating_sub(time) < DELETE_GUARD_SECS {
                info!("{} was referenced recently by {}, refusing delete", id, node);
                return Err(ApiError(CbfsError::BadRequest(format!(
                    "{} referenced within the last hour",
                    id
                ))));
            }
        }
    }

    state.store.delete(&id).await?;
    if let Err(e) = forget_ownership(state.meta.as_ref(), &id, &state.node_name).await {
        warn!("forgetting ownership of deleted {} failed: {}", id, e);
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ---- cluster endpoints ----

async fn list_nodes(State(state): State<NodeState>) -> ApiResult {
    let now = cbfs_lib::unix_timestamp();
    let mut out = serde_json::Map::new();
    for node in state.peers().await.all_nodes().await? {
        let age_secs = now.saturating_sub(node.time);
        out.insert(
            node.name.clone(),
            json!({
                "size": node.storage_size,
                "addr": node.address(),
                "hbtime": rfc3339(node.time),
                "hbage_ms": age_secs * 1000,
                "hash": node.hash_algorithm,
                "used": node.used,
                "free": node.free,
                "addr_raw": node.addr,
                "bindaddr": format!(":{}", node.bind_port),
            }),
        );
    }
    Ok(axum::Json(Value::Object(out)).into_response())
}

async fn get_config(State(state): State<NodeState>) -> ApiResult {
    let config = state.refresh_config().await?;
    Ok(axum::Json(config).into_response())
}

async fn put_config(State(state): State<NodeState>, body: axum::body::Bytes) -> ApiResult {
    let config: cluster_meta::ClusterConfig = serde_json::from_slice(&body)
        .map_err(|e| CbfsError::BadRequest(format!("bad config document: {}", e)))?;
    store_config(state.meta.as_ref(), &config).await?;
    state.refresh_config().await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn get_meta(State(state): State<NodeState>, Path(path): Path<String>) -> ApiResult {
    let meta = get_file_meta(state.meta.as_ref(), &path)
        .await?
        .ok_or_else(|| CbfsError::NotFound(format!("no file at {}", path)))?;
    Ok(axum::Json(meta.userdata.unwrap_or_else(|| json!({}))).into_response())
}

async fn put_meta(
    State(state): State<NodeState>,
    Path(path): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult {
    let userdata: Value = serde_json::from_slice(&body)
        .map_err(|e| CbfsError::BadRequest(format!("bad userdata: {}", e)))?;
    set_userdata(state.meta.as_ref(), &path, userdata).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn fetch_blob(
    State(state): State<NodeState>,
    Path(oid): Path<String>,
    req: Request,
) -> ApiResult {
    let id = BlobId::from_hex(&oid)?;
    let ownership = get_ownership(state.meta.as_ref(), &id)
        .await?
        .ok_or_else(|| CbfsError::NotFound(format!("no ownership record for {}", id)))?;

    if state.store.available_space().unwrap_or(0) < ownership.length {
        warn!("asked to fetch {}, but out of space", id);
        return Err(ApiError(CbfsError::Unavailable(
            "no free space available".to_string(),
        )));
    }

    let prev_node = req
        .headers()
        .get(PREVNODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    if !state.enqueue_fetch(FetchRequest { oid: id, prev_node }) {
        return Err(ApiError(CbfsError::Unavailable(
            "fetch queue full".to_string(),
        )));
    }
    Ok(StatusCode::ACCEPTED.into_response())
}

async fn list_docs(
    State(state): State<NodeState>,
    Path(path): Path<String>,
    req: Request,
) -> ApiResult {
    let uri = req.uri();
    let depth = match query_param(uri, "depth") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|e| CbfsError::BadRequest(format!("bad depth parameter: {}", e)))?,
        None => 1,
    };
    let include_meta = query_param(uri, "includeMeta").as_deref() == Some("true");
    let dir = path.trim_end_matches('/').to_string();

    let entries = list_file_metas(state.meta.as_ref(), &dir).await?;
    let mut files = serde_json::Map::new();
    let mut dirs: HashMap<String, (u64, u64)> = HashMap::new();
    for (relative, meta) in entries {
        let segments: Vec<&str> = relative.split('/').collect();
        if segments.len() <= depth.max(1) {
            let value = if include_meta {
                serde_json::to_value(&meta).unwrap_or(Value::Null)
            } else {
                json!({
                    "oid": meta.oid,
                    "length": meta.length,
                    "modified": meta.modified,
                    "revno": meta.revno,
                })
            };
            files.insert(relative, value);
        } else {
            let bucket = segments[..depth.max(1)].join("/");
            let entry = dirs.entry(bucket).or_insert((0, 0));
            entry.0 += 1;
            entry.1 += meta.length;
        }
    }

    if files.is_empty() && dirs.is_empty() {
        return Err(ApiError(CbfsError::NotFound(format!(
            "nothing under {}",
            dir
        ))));
    }

    let dir_values: serde_json::Map<String, Value> = dirs
        .into_iter()
        .map(|(name, (descendants, size))| {
            (name, json!({"descendants": descendants, "size": size}))
        })
        .collect();
    Ok(axum::Json(json!({
        "path": path,
        "files": Value::Object(files),
        "dirs": Value::Object(dir_values),
    }))
    .into_response())
}

// ---- user file CRUD ----

async fn user_file(State(state): State<NodeState>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    // Everything under the reserved prefix has explicit routes; leftovers
    // are malformed.
    if path == "/.cbfs" || path.starts_with(RESERVED_PREFIX) {
        return (StatusCode::BAD_REQUEST, "reserved prefix").into_response();
    }

    let method = req.method().clone();
    let result = if method == Method::PUT {
        user_put(state, req).await
    } else if method == Method::GET {
        user_get(state, req).await
    } else if method == Method::HEAD {
        user_head(state, req).await
    } else if method == Method::DELETE {
        user_delete(state, req).await
    } else {
        Ok(StatusCode::METHOD_NOT_ALLOWED.into_response())
    };
    result.unwrap_or_else(|e| e.into_response())
}

fn apply_doc_headers(
    response: &mut Response,
    stored: &StoredHeaders,
    oid: &str,
    modified: u64,
    revno: u32,
    oldest: u32,
) {
    if let Some(content_type) = stored_content_type(stored) {
        let value = header_value(content_type);
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    let etag = format!("\"{}\"", oid);
    response.headers_mut().insert(header::ETAG, header_value(&etag));
    response
        .headers_mut()
        .insert(header::LAST_MODIFIED, header_value(&http_date(modified)));
    set_header(response, REVNO_HEADER, &revno.to_string());
    set_header(response, OLDEST_REV_HEADER, &oldest.to_string());
}

async fn user_put(state: NodeState, req: Request) -> ApiResult {
    let raw_path = req.uri().path().to_string();
    if raw_path.contains("//") {
        return Err(ApiError(CbfsError::BadRequest(format!(
            "too many slashes in the path name: {}",
            raw_path
        ))));
    }
    let resolved = resolve_path(&raw_path);

    let expected = match req
        .headers()
        .get(HASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(asserted) => Some(BlobId::from_hex(asserted)?),
        None => None,
    };
    let keep_revs = req
        .headers()
        .get(KEEP_REVS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u32>().ok());
    let stored = stored_headers(req.headers());

    let mut reader = body_reader(req);
    let result = store_blob_stream(&state, &mut reader, expected, true).await?;
    info!("wrote {} -> {}", resolved, result.oid);
    if let Some(peer) = &result.replicated_to {
        debug!("replica of {} landed on {}", result.oid, peer);
    }

    let config = state.config().await;
    let keep_revs = keep_revs.unwrap_or(config.default_version_count);
    let meta = FileMeta {
        headers: stored,
        oid: result.oid.to_hex(),
        length: result.length,
        modified: cbfs_lib::unix_timestamp(),
        revno: 0,
        previous: Vec::new(),
        userdata: None,
    };
    store_file_meta(state.meta.as_ref(), &resolved, meta, keep_revs).await?;

    // One copy here, one on the tee target; anything above two is
    // background work.
    if config.min_replicas > 2 {
        spawn_replica_top_up(state.clone(), result.oid.clone(), config.min_replicas - 2);
    }

    Ok((
        StatusCode::CREATED,
        [(HASH_HEADER, result.oid.to_hex())],
        Body::empty(),
    )
        .into_response())
}

async fn user_get(state: NodeState, req: Request) -> ApiResult {
    let uri = req.uri().clone();
    let resolved = resolve_path(uri.path());
    let meta = get_file_meta(state.meta.as_ref(), &resolved)
        .await?
        .ok_or_else(|| CbfsError::NotFound(format!("no file at {}", resolved)))?;

    let mut oid = meta.oid.clone();
    let mut sel_headers = meta.headers.clone();
    let mut modified = meta.modified;
    let mut revno = meta.revno;
    if let Some(raw_rev) = query_param(&uri, "rev") {
        let wanted: u32 = raw_rev
            .parse()
            .map_err(|_| CbfsError::BadRequest("invalid revno".to_string()))?;
        let prev = meta.find_previous(wanted).ok_or_else(|| {
            CbfsError::Gone(format!("don't have {} at rev {}", resolved, wanted))
        })?;
        oid = prev.oid.clone();
        sel_headers = prev.headers.clone();
        modified = prev.modified;
        revno = prev.revno;
    }
    let oldest = meta.oldest_revno();

    if let Some(inm) = req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if inm.trim_matches('"') == meta.oid {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            set_header(&mut response, REVNO_HEADER, &revno.to_string());
            set_header(&mut response, OLDEST_REV_HEADER, &oldest.to_string());
            return Ok(response);
        }
    }

    let id = BlobId::from_hex(&oid)
        .map_err(|_| CbfsError::Internal(format!("corrupt oid in metadata for {}", resolved)))?;
    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    match local_blob_response(&state, &id, range.as_deref()).await {
        Ok(mut response) => {
            apply_doc_headers(&mut response, &sel_headers, &oid, modified, revno, oldest);
            spawn_touch_access(&state, id);
            Ok(response)
        }
        Err(e) if e.is_not_found() => {
            let (reader, length) = open_remote_blob(&state, &id, None, None).await?;
            let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, header_value(&length.to_string()));
            apply_doc_headers(&mut response, &sel_headers, &oid, modified, revno, oldest);
            Ok(response)
        }
        Err(e) => Err(ApiError(e)),
    }
}

async fn user_head(state: NodeState, req: Request) -> ApiResult {
    let uri = req.uri().clone();
    if query_param(&uri, "rev").is_some() {
        return Err(ApiError(CbfsError::BadRequest(
            "rev is not valid on HEAD".to_string(),
        )));
    }
    let resolved = resolve_path(uri.path());
    let meta = get_file_meta(state.meta.as_ref(), &resolved)
        .await?
        .ok_or_else(|| CbfsError::NotFound(format!("no file at {}", resolved)))?;

    let mut response = Response::new(Body::empty());
    apply_doc_headers(
        &mut response,
        &meta.headers,
        &meta.oid,
        meta.modified,
        meta.revno,
        meta.oldest_revno(),
    );
    response.headers_mut().insert(
        header::CONTENT_LENGTH,
        header_value(&meta.length.to_string()),
    );
    Ok(response)
}

async fn user_delete(state: NodeState, req: Request) -> ApiResult {
    let resolved = resolve_path(req.uri().path());
    // Blobs stay behind for the collector; only the path goes away.
    if delete_file_meta(state.meta.as_ref(), &resolved).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(ApiError(CbfsError::NotFound(format!(
            "no file at {}",
            resolved
        ))))
    }
}

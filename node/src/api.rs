use std::convert::Infallible;
use std::sync::Arc;

use chordkv_lib::dht_messages::NodeInfo;
use chordkv_lib::display_id;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::error::NodeError;
use crate::network_client::NetworkClient;
use crate::node::{log_error, log_info, ChordNode};

/// Upper bound on members listed by `GET /ring`.
const RING_WALK_LIMIT: usize = 256;

/// Successors listed by `GET /successors`.
const SUCCESSOR_LIST_LEN: usize = 4;

/// One item of a `POST /insert` batch.
#[derive(Debug, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Body of `POST /join`; an empty body joins via the configured bootstrap.
#[derive(Debug, Default, Deserialize)]
pub struct JoinRequest {
    pub bootstrap: Option<String>,
}

fn format_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn not_found() -> Response<Full<Bytes>> {
    format_response(StatusCode::NOT_FOUND, json!({ "error": "Not Found" }))
}

fn bad_request(message: String) -> Response<Full<Bytes>> {
    format_response(StatusCode::BAD_REQUEST, json!({ "error": message }))
}

fn node_error(e: &NodeError) -> Response<Full<Bytes>> {
    let status = match e {
        NodeError::AlreadyLeft => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    format_response(status, json!({ "error": e.to_string() }))
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, Response<Full<Bytes>>> {
    match req.into_body().collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(bad_request(format!("failed to read body: {}", e))),
    }
}

pub fn parse_batch(body: &[u8]) -> Result<Vec<KeyValue>, serde_json::Error> {
    serde_json::from_slice(body)
}

pub fn parse_join_request(body: &[u8]) -> Result<JoinRequest, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(JoinRequest::default());
    }
    serde_json::from_slice(body)
}

fn node_json(node: &NodeInfo) -> Value {
    json!({
        "id": display_id(&node.id),
        "address": node.address,
        "api_address": node.api_address,
    })
}

fn state<T: NetworkClient>(node: &ChordNode<T>) -> Response<Full<Bytes>> {
    let snapshot = node.state_snapshot();
    let fingers: Vec<Value> = snapshot.finger_table.iter().map(node_json).collect();
    format_response(
        StatusCode::OK,
        json!({
            "node": node_json(&node.info),
            "alive": node.is_alive(),
            "bits": node.space().bits(),
            "successor": node_json(&snapshot.successor),
            "predecessor": snapshot.predecessor.as_ref().map(node_json),
            "fingers": fingers,
            "local_keys": snapshot.store.len(),
        }),
    )
}

async fn ring<T: NetworkClient>(node: &ChordNode<T>) -> Response<Full<Bytes>> {
    let members: Vec<Value> = node
        .walk_ring(RING_WALK_LIMIT)
        .await
        .iter()
        .map(node_json)
        .collect();
    format_response(
        StatusCode::OK,
        json!({ "size": members.len(), "members": members }),
    )
}

async fn successors<T: NetworkClient>(node: &ChordNode<T>) -> Response<Full<Bytes>> {
    let successors: Vec<Value> = node
        .walk_ring(SUCCESSOR_LIST_LEN + 1)
        .await
        .iter()
        .skip(1)
        .map(node_json)
        .collect();
    format_response(StatusCode::OK, json!({ "successors": successors }))
}

fn predecessor<T: NetworkClient>(node: &ChordNode<T>) -> Response<Full<Bytes>> {
    format_response(
        StatusCode::OK,
        json!({ "predecessor": node.predecessor().as_ref().map(node_json) }),
    )
}

/// The keys this node holds, whether or not it still owns them.
fn data<T: NetworkClient>(node: &ChordNode<T>) -> Response<Full<Bytes>> {
    let entries: Vec<Value> = node
        .local_entries()
        .iter()
        .map(|(key, value)| json!({ "key": key, "value": String::from_utf8_lossy(value) }))
        .collect();
    format_response(
        StatusCode::OK,
        json!({ "node": node_json(&node.info), "count": entries.len(), "data": entries }),
    )
}

fn metrics<T: NetworkClient>(node: &ChordNode<T>) -> Response<Full<Bytes>> {
    match serde_json::to_value(node.metrics()) {
        Ok(body) => format_response(StatusCode::OK, body),
        Err(e) => format_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": e.to_string() }),
        ),
    }
}

async fn get_key<T: NetworkClient>(node: &ChordNode<T>, key: &str) -> Response<Full<Bytes>> {
    match node.search(key).await {
        Ok(Some(value)) => format_response(
            StatusCode::OK,
            json!({ "key": key, "value": String::from_utf8_lossy(&value) }),
        ),
        Ok(None) => format_response(
            StatusCode::NOT_FOUND,
            json!({ "key": key, "error": "key not found" }),
        ),
        Err(e) => node_error(&e),
    }
}

async fn put_key<T: NetworkClient>(
    node: &ChordNode<T>,
    key: &str,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let value = match read_body(req).await {
        Ok(body) => body.to_vec(),
        Err(response) => return response,
    };
    match node.insert(key, value).await {
        Ok(()) => format_response(StatusCode::OK, json!({ "key": key, "stored": true })),
        Err(e) => node_error(&e),
    }
}

/// Stores every item of the batch, reporting each key separately.
pub async fn insert_batch<T: NetworkClient>(
    node: &ChordNode<T>,
    items: Vec<KeyValue>,
) -> Response<Full<Bytes>> {
    let mut failed = 0;
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        match node.insert(&item.key, item.value.into_bytes()).await {
            Ok(()) => results.push(json!({ "key": item.key, "stored": true })),
            Err(e) => {
                failed += 1;
                results.push(json!({ "key": item.key, "stored": false, "error": e.to_string() }));
            }
        }
    }
    let status = if failed == 0 {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    format_response(status, json!({ "failed": failed, "results": results }))
}

async fn insert<T: NetworkClient>(node: &ChordNode<T>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    match parse_batch(&body) {
        Ok(items) => insert_batch(node, items).await,
        Err(e) => bad_request(format!("expected a list of {{key, value}}: {}", e)),
    }
}

async fn leave<T: NetworkClient>(node: &ChordNode<T>) -> Response<Full<Bytes>> {
    match node.leave().await {
        Ok(()) => format_response(StatusCode::OK, json!({ "left": true })),
        Err(NodeError::AlreadyLeft) => format_response(
            StatusCode::CONFLICT,
            json!({ "error": NodeError::AlreadyLeft.to_string() }),
        ),
        Err(e) => node_error(&e),
    }
}

/// Re-enters the ring after a leave and restarts stabilization.
pub async fn rejoin<T: NetworkClient>(
    node: &ChordNode<T>,
    request: JoinRequest,
    default_bootstrap: Option<&str>,
) -> Response<Full<Bytes>> {
    if node.is_alive() {
        return format_response(
            StatusCode::CONFLICT,
            json!({ "error": "node is already part of a ring" }),
        );
    }
    let bootstrap = request.bootstrap.as_deref().or(default_bootstrap);
    match node.join(bootstrap).await {
        Ok(()) => {
            node.spawn_stabilizer();
            format_response(
                StatusCode::OK,
                json!({ "joined": true, "successor": node_json(&node.successor()) }),
            )
        }
        Err(e) => node_error(&e),
    }
}

async fn join<T: NetworkClient>(
    node: &ChordNode<T>,
    req: Request<Incoming>,
    default_bootstrap: Option<&str>,
) -> Response<Full<Bytes>> {
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    match parse_join_request(&body) {
        Ok(request) => rejoin(node, request, default_bootstrap).await,
        Err(e) => bad_request(format!("invalid join request: {}", e)),
    }
}

async fn delete_key<T: NetworkClient>(node: &ChordNode<T>, key: &str) -> Response<Full<Bytes>> {
    match node.delete(key).await {
        Ok(existed) => format_response(
            StatusCode::OK,
            json!({ "key": key, "deleted": existed }),
        ),
        Err(e) => node_error(&e),
    }
}

async fn handler<T: NetworkClient>(
    node: Arc<ChordNode<T>>,
    bootstrap: Arc<Option<String>>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let response = match (method, path.as_str()) {
        (Method::GET, "/ping") => format_response(StatusCode::OK, json!({ "message": "pong" })),
        (Method::GET, "/state") => state(&node),
        (Method::GET, "/ring") => ring(&node).await,
        (Method::GET, "/metrics") => metrics(&node),
        (Method::GET, "/data") => data(&node),
        (Method::GET, "/successors") => successors(&node).await,
        (Method::GET, "/predecessor") => predecessor(&node),
        (Method::POST, "/insert") => insert(&node, req).await,
        (Method::POST, "/leave") => leave(&node).await,
        (Method::POST, "/join") => join(&node, req, bootstrap.as_deref()).await,
        (method, path) => match path.strip_prefix("/keys/").filter(|key| !key.is_empty()) {
            Some(key) => match method {
                Method::GET => get_key(&node, key).await,
                Method::PUT => put_key(&node, key, req).await,
                Method::DELETE => delete_key(&node, key).await,
                _ => format_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    json!({ "error": "Method Not Allowed" }),
                ),
            },
            None => not_found(),
        },
    };
    Ok(response)
}

/// Serves the HTTP API for `node` on `address` until the listener fails.
/// `POST /join` without a body joins via `bootstrap`.
pub async fn run<T: NetworkClient>(
    node: ChordNode<T>,
    address: &str,
    bootstrap: Option<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(address).await?;
    log_info!(node.info.address, "API is listening on http://{}", address);

    let node = Arc::new(node);
    let bootstrap = Arc::new(bootstrap);
    loop {
        let (tcp, _) = listener.accept().await?;
        let io = TokioIo::new(tcp);
        let node = node.clone();
        let bootstrap = bootstrap.clone();
        let node_address = node.info.address.clone();
        tokio::task::spawn(async move {
            let service =
                service_fn(move |req| handler(node.clone(), bootstrap.clone(), req));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                log_error!(node_address, "Error serving API connection: {:?}", err);
            }
        });
    }
}

//! The node's HTTP surface.
//!
//! Peer-facing routes:
//! - `POST /internal/replicate`: apply a replicated entry to the local
//!   log store, preserving the supplied timestamp. Receipt is terminal.
//! - `GET /internal/read?key=<hex>`: the local record for a key, 404 for
//!   absent or tombstoned keys.
//!
//! Client-facing routes, a thin shim over the coordinator:
//! - `PUT /kv/<key>` (body = value), `GET /kv/<key>`, `DELETE /kv/<key>`,
//!   each accepting `?consistency=one|quorum|all`
//! - `GET /stats`: local storage statistics

use crate::{ReplicateRequest, ReplicateResponse};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use keel_common::{ConsistencyLevel, Record};
use keel_kv::{Coordinator, KvError, ReplicationTransport};
use keel_storage::{LogStore, StorageError};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};

/// Everything the HTTP handlers need.
pub struct ApiContext<T: ReplicationTransport> {
    pub coordinator: Arc<Coordinator<T>>,
    pub store: Arc<RwLock<LogStore>>,
}

impl<T: ReplicationTransport> Clone for ApiContext<T> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            store: self.store.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct GetBody {
    key: String,
    value: Vec<u8>,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct OkBody {
    success: bool,
}

/// Serve the node's HTTP endpoints on `listener` until `shutdown` fires.
pub async fn serve<T: ReplicationTransport>(
    ctx: ApiContext<T>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    tracing::info!("http endpoints listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, ctx.clone()));
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!("http connection error: {}", e);
                    }
                });
            }
            _ = shutdown.changed() => {
                tracing::debug!("http server stopped");
                return Ok(());
            }
        }
    }
}

async fn handle<T: ReplicationTransport>(
    req: Request<hyper::body::Incoming>,
    ctx: ApiContext<T>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let path = req.uri().path().to_string();
    let response = match (req.method().clone(), path.as_str()) {
        (Method::POST, "/internal/replicate") => handle_replicate(req, &ctx).await,
        (Method::GET, "/internal/read") => handle_internal_read(req, &ctx).await,
        (Method::GET, "/stats") => handle_stats(&ctx).await,
        (method, p) if p.starts_with("/kv/") => handle_kv(method, req, &ctx).await,
        _ => json_response(
            StatusCode::NOT_FOUND,
            &ErrorBody {
                error: "no such endpoint".into(),
            },
        ),
    };
    Ok(response)
}

// ---------------------------------------------------------------------------
// Peer-facing handlers
// ---------------------------------------------------------------------------

async fn handle_replicate<T: ReplicationTransport>(
    req: Request<hyper::body::Incoming>,
    ctx: &ApiContext<T>,
) -> Response<Full<Bytes>> {
    keel_metrics::metrics().replications_received.inc();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ErrorBody {
                    error: format!("failed to read request body: {}", e),
                },
            )
        }
    };

    let request: ReplicateRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ErrorBody {
                    error: format!("invalid request format: {}", e),
                },
            )
        }
    };

    let entry = request.entry;
    let result = {
        let mut s = ctx.store.write().await;
        if entry.is_deleted {
            s.delete(&entry.key, entry.timestamp)
        } else {
            s.put(&entry.key, &entry.value, entry.timestamp)
        }
    };

    match result {
        Ok(()) => json_response(
            StatusCode::OK,
            &ReplicateResponse {
                success: true,
                message: None,
            },
        ),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ReplicateResponse {
                success: false,
                message: Some(e.to_string()),
            },
        ),
    }
}

async fn handle_internal_read<T: ReplicationTransport>(
    req: Request<hyper::body::Incoming>,
    ctx: &ApiContext<T>,
) -> Response<Full<Bytes>> {
    keel_metrics::metrics().replications_received.inc();

    let key = req
        .uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("key="))
                .map(str::to_string)
        })
        .and_then(|k| hex::decode(k).ok());

    let Some(key) = key else {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ErrorBody {
                error: "key is required as hex".into(),
            },
        );
    };

    let result = {
        let s = ctx.store.read().await;
        s.get(&key)
    };

    match result {
        Ok((value, timestamp)) => {
            json_response(StatusCode::OK, &Record::new(key, value, timestamp))
        }
        Err(StorageError::NotFound) | Err(StorageError::Tombstoned) => json_response(
            StatusCode::NOT_FOUND,
            &ErrorBody {
                error: "key not found".into(),
            },
        ),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ErrorBody {
                error: e.to_string(),
            },
        ),
    }
}

// ---------------------------------------------------------------------------
// Client-facing handlers
// ---------------------------------------------------------------------------

async fn handle_kv<T: ReplicationTransport>(
    method: Method,
    req: Request<hyper::body::Incoming>,
    ctx: &ApiContext<T>,
) -> Response<Full<Bytes>> {
    let key = req.uri().path()["/kv/".len()..].as_bytes().to_vec();
    if key.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            &ErrorBody {
                error: "key is required".into(),
            },
        );
    }

    let consistency = req
        .uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("consistency="))
        })
        .map(ConsistencyLevel::from_str_config)
        .unwrap_or(ConsistencyLevel::Quorum);

    match method {
        Method::GET => match ctx.coordinator.get(&key, consistency).await {
            Ok((value, timestamp)) => json_response(
                StatusCode::OK,
                &GetBody {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    value,
                    timestamp,
                },
            ),
            Err(e) => kv_error_response(e),
        },
        Method::PUT => {
            let value = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes().to_vec(),
                Err(e) => {
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        &ErrorBody {
                            error: format!("failed to read request body: {}", e),
                        },
                    )
                }
            };
            match ctx.coordinator.put(&key, value, consistency).await {
                Ok(()) => json_response(StatusCode::OK, &OkBody { success: true }),
                Err(e) => kv_error_response(e),
            }
        }
        Method::DELETE => match ctx.coordinator.delete(&key, consistency).await {
            Ok(()) => json_response(StatusCode::OK, &OkBody { success: true }),
            Err(e) => kv_error_response(e),
        },
        _ => json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &ErrorBody {
                error: "unsupported method".into(),
            },
        ),
    }
}

async fn handle_stats<T: ReplicationTransport>(ctx: &ApiContext<T>) -> Response<Full<Bytes>> {
    let stats = {
        let s = ctx.store.read().await;
        s.stats()
    };
    json_response(StatusCode::OK, &stats)
}

fn kv_error_response(e: KvError) -> Response<Full<Bytes>> {
    let status = match e {
        KvError::NotFound => StatusCode::NOT_FOUND,
        KvError::QuorumFailed { .. } | KvError::RingEmpty => StatusCode::SERVICE_UNAVAILABLE,
    };
    json_response(
        status,
        &ErrorBody {
            error: e.to_string(),
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(payload)))
        .expect("valid HTTP response")
}

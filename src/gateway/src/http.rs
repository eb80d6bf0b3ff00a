// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The HTTP and WebSocket surfaces of the gateway.
//!
//! `POST /<endpoint>` executes one request; `/openapi.json` publishes the
//! derived OpenAPI document; `GET /` upgrades to a WebSocket where one
//! connection is one streaming call (text frames carry JSON, binary frames
//! the compact wire encoding; subprotocol `bytes` selects binary).

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flow_repr::document::Content;
use flow_repr::schema::SchemaMap;
use flow_repr::value::{json_to_value, value_to_json};
use flow_repr::{wire, DataRequest, DocBatch, Document, Error, ErrorKind, ErrorStrategy, Route};

use crate::metrics::GatewayMetrics;
use crate::streamer::RequestStreamer;

/// Shared state of the HTTP surface.
pub struct HttpState {
    pub streamer: RequestStreamer,
    pub schemas: SchemaMap,
    pub metrics: GatewayMetrics,
}

/// Builds the router serving JSON, OpenAPI, liveness, and WebSocket.
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/", get(handle_ws_upgrade))
        .route("/healthz", get(|| async { "ok" }))
        .route("/openapi.json", get(handle_openapi))
        .fallback(handle_endpoint)
        .with_state(state)
}

/// The JSON form of a document on the HTTP surface.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JsonDoc {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<JsonDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<JsonDoc>,
}

impl JsonDoc {
    fn into_document(self) -> Document {
        Document {
            id: if self.id.is_empty() {
                uuid_simple()
            } else {
                self.id
            },
            content: match self.text {
                Some(text) => Content::Text(text),
                None => Content::Empty,
            },
            chunks: self.chunks.into_iter().map(JsonDoc::into_document).collect(),
            matches: self
                .matches
                .into_iter()
                .map(JsonDoc::into_document)
                .collect(),
            tags: self
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        }
    }

    fn from_document(doc: &Document) -> JsonDoc {
        JsonDoc {
            id: doc.id.clone(),
            text: doc.text_content().map(String::from),
            tags: doc
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
            chunks: doc.chunks.iter().map(JsonDoc::from_document).collect(),
            matches: doc.matches.iter().map(JsonDoc::from_document).collect(),
        }
    }
}

fn uuid_simple() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// `POST /<endpoint>` request body.
#[derive(Debug, Default, Deserialize)]
pub struct CallBody {
    #[serde(default)]
    pub data: Vec<JsonDoc>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub target_executor: Option<String>,
}

/// `POST /<endpoint>` response body.
#[derive(Debug, Serialize)]
pub struct CallResponse {
    pub data: Vec<JsonDoc>,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub routes: Vec<Route>,
}

/// Error body: `{detail, routes}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
    routes: Vec<Route>,
}

fn build_request(endpoint: &str, body: CallBody) -> DataRequest {
    let docs: DocBatch = body.data.into_iter().map(JsonDoc::into_document).collect();
    let mut req = DataRequest::new(endpoint, docs);
    req.parameters = body
        .parameters
        .iter()
        .map(|(k, v)| (k.clone(), json_to_value(v)))
        .collect();
    req.headers.target_executor = body.target_executor;
    req
}

fn build_response(resp: DataRequest) -> CallResponse {
    CallResponse {
        data: resp.docs.iter().map(JsonDoc::from_document).collect(),
        parameters: resp
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect(),
        routes: resp.routes,
    }
}

fn error_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput | ErrorKind::NoSuchEndpoint => StatusCode::BAD_REQUEST,
        ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_endpoint(
    State(state): State<Arc<HttpState>>,
    uri: Uri,
    Json(body): Json<CallBody>,
) -> Response {
    let endpoint = uri.path().to_string();
    debug!(endpoint = %endpoint, "http: call");
    let result = state.streamer.execute(build_request(&endpoint, body)).await;
    state.metrics.observe(&result);
    match result {
        Ok(resp) => {
            if state.streamer.driver().on_error() == ErrorStrategy::ThrowEarly {
                if let Some(route) = resp.first_failure() {
                    let kind = route
                        .error
                        .as_ref()
                        .map(|e| e.kind)
                        .unwrap_or(ErrorKind::Internal);
                    let detail = route
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "request failed".into());
                    let body = ErrorBody {
                        detail,
                        routes: resp.routes.clone(),
                    };
                    return (error_status(kind), Json(body)).into_response();
                }
            }
            Json(build_response(resp)).into_response()
        }
        Err(err) => {
            let body = ErrorBody {
                detail: err.message.clone(),
                routes: Vec::new(),
            };
            (error_status(err.kind), Json(body)).into_response()
        }
    }
}

async fn handle_openapi(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    Json(openapi_document(&state.schemas))
}

/// Derives the OpenAPI document from the aggregated schema map.
pub fn openapi_document(schemas: &SchemaMap) -> serde_json::Value {
    let doc_schema = serde_json::json!({"$ref": "#/components/schemas/Document"});
    let mut paths = serde_json::Map::new();
    for endpoint in schemas.keys() {
        if endpoint.starts_with("__") {
            continue;
        }
        paths.insert(
            endpoint.clone(),
            serde_json::json!({
                "post": {
                    "requestBody": {"content": {"application/json": {"schema": {
                        "type": "object",
                        "properties": {
                            "data": {"type": "array", "items": doc_schema},
                            "parameters": {"type": "object"},
                        },
                    }}}},
                    "responses": {"200": {"description": "the processed batch",
                        "content": {"application/json": {"schema": {
                            "type": "object",
                            "properties": {
                                "data": {"type": "array", "items": doc_schema},
                                "parameters": {"type": "object"},
                                "routes": {"type": "array"},
                            },
                        }}}}},
                }
            }),
        );
    }
    serde_json::json!({
        "openapi": "3.0.3",
        "info": {"title": "flowd gateway", "version": env!("CARGO_PKG_VERSION")},
        "paths": paths,
        "components": {"schemas": {"Document": {
            "type": "object",
            "properties": {
                "id": {"type": "string"},
                "text": {"type": "string"},
                "tags": {"type": "object"},
                "chunks": {"type": "array"},
                "matches": {"type": "array"},
            },
        }}},
    })
}

/// A JSON-framed WebSocket request.
#[derive(Debug, Deserialize)]
struct WsRequest {
    endpoint: String,
    #[serde(flatten)]
    body: CallBody,
}

async fn handle_ws_upgrade(
    State(state): State<Arc<HttpState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.protocols(["bytes"])
        .on_upgrade(move |socket| run_ws(state, socket))
}

async fn run_ws(state: Arc<HttpState>, socket: WebSocket) {
    let binary = socket.protocol().is_some_and(|p| p.as_bytes() == b"bytes");
    let on_error = state.streamer.driver().on_error();
    let (mut sink, mut source) = socket.split();

    // Decode inbound frames into a request channel; the streamer applies
    // prefetch and ordering exactly as it does for gRPC calls. An
    // undecodable frame poisons the call: the reader stops, pending
    // responses drain, and the error closes the stream.
    let (req_tx, req_rx) = tokio::sync::mpsc::channel::<DataRequest>(16);
    let poison = Arc::new(parking_lot::Mutex::new(None::<Error>));
    use flow_ore::task::JoinHandleExt;
    let reader = flow_ore::task::spawn(|| "ws-reader", {
        let poison = Arc::clone(&poison);
        async move {
            while let Some(frame) = source.next().await {
                let decoded = match frame {
                    Ok(Message::Text(json)) => serde_json::from_str::<WsRequest>(&json)
                        .map(|r| build_request(&r.endpoint, r.body))
                        .map_err(|e| Error::invalid_input("gateway", format!("bad frame: {e}"))),
                    Ok(Message::Binary(bytes)) => wire::decode(&bytes),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(req) => {
                        if req_tx.send(req).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        *poison.lock() = Some(err);
                        break;
                    }
                }
            }
        }
    })
    .abort_on_drop();

    let requests = tokio_stream::wrappers::ReceiverStream::new(req_rx);
    let mut responses = state.streamer.stream(requests);

    let mut failure: Option<Error> = None;
    while let Some(result) = responses.next().await {
        state.metrics.observe(&result);
        match result {
            Ok(resp) => {
                if on_error == ErrorStrategy::ThrowEarly {
                    if let Some(route) = resp.first_failure() {
                        failure = route
                            .error
                            .clone()
                            .or_else(|| Some(Error::internal("gateway", "request failed")));
                        break;
                    }
                }
                let frame = if binary {
                    match wire::encode(&resp) {
                        Ok(bytes) => Message::Binary(bytes.to_vec()),
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                } else {
                    match serde_json::to_string(&build_response(resp)) {
                        Ok(json) => Message::Text(json),
                        Err(e) => {
                            failure = Some(Error::internal("gateway", e.to_string()));
                            break;
                        }
                    }
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    let failure = failure.or_else(|| poison.lock().take());

    if let Some(err) = failure {
        warn!(error = %err, "ws: closing call with error");
        let body = serde_json::json!({"detail": &err.message, "routes": []});
        let frame = if binary {
            Message::Binary(body.to_string().into_bytes())
        } else {
            Message::Text(body.to_string())
        };
        let _ = sink.send(frame).await;
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::ERROR,
                reason: err.message.into(),
            })))
            .await;
    } else {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "".into(),
            })))
            .await;
    }
    drop(reader);
}

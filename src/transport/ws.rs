//! Subscriptions over WebSocket using the `graphql-ws` sub-protocol.
//!
//! One socket per subscription: `connection_init` → `connection_ack`, then a
//! single `start`; `data` frames are forwarded until `complete`, an error, or
//! cancellation, at which point `stop` and `connection_terminate` are sent.
//! A socket lost mid-subscription is re-dialled with backoff.

use super::{StreamExecutor, TransportError};
use crate::pipeline::RetryPolicy;
use crate::types::{GraphqlError, GraphqlRequest, GraphqlResponse};
use crate::{BoxStream, Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// WebSocket sub-protocol spoken on the stream channel.
pub const SUB_PROTOCOL: &str = "graphql-ws";
const CHANNEL_CAPACITY: usize = 32;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;
type Source = SplitStream<Socket>;

#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Value,
}

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::Transport(TransportError::Protocol(msg.into()))
}

fn ws_error(e: tokio_tungstenite::tungstenite::Error) -> Error {
    Error::Transport(TransportError::WebSocket(e))
}

/// Errors carried by an `error` frame: a list of GraphQL errors or a single one.
fn payload_errors(payload: Value) -> Vec<GraphqlError> {
    match payload {
        Value::Array(items) => items
            .into_iter()
            .map(|v| {
                serde_json::from_value(v.clone())
                    .unwrap_or_else(|_| GraphqlError::new(v.to_string()))
            })
            .collect(),
        Value::Null => vec![GraphqlError::new("subscription failed")],
        other => vec![serde_json::from_value(other.clone())
            .unwrap_or_else(|_| GraphqlError::new(other.to_string()))],
    }
}

/// Dials the endpoint and performs the `graphql-ws` handshake.
#[derive(Debug, Clone)]
struct Connector {
    endpoint: Url,
    ack_timeout: Duration,
}

impl Connector {
    async fn handshake(&self) -> Result<(Sink, Source)> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(ws_error)?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUB_PROTOCOL));

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(ws_error)?;
        let (mut sink, mut source) = socket.split();

        sink.send(Message::Text(
            json!({"type": "connection_init", "payload": {}}).to_string(),
        ))
        .await
        .map_err(ws_error)?;

        tokio::time::timeout(self.ack_timeout, await_ack(&mut source))
            .await
            .map_err(|_| protocol_error("timed out waiting for connection_ack"))??;

        Ok((sink, source))
    }

    /// Handshake, then send the `start` frame for subscription `id`.
    async fn open(&self, id: &str, start: &str) -> Result<(Sink, Source)> {
        let (mut sink, source) = self.handshake().await?;
        sink.send(Message::Text(start.to_string()))
            .await
            .map_err(ws_error)?;
        debug!(subscription_id = id, endpoint = self.endpoint.as_str(), "subscription started");
        Ok((sink, source))
    }
}

/// `graphql-ws` stream channel.
///
/// A socket that drops before the server completes the subscription is
/// re-dialled and the subscription restarted under the same id, waiting
/// between tries as the reconnect [`RetryPolicy`] prescribes. Its
/// `max_attempts` bounds consecutive connection attempts; a reconnect that
/// delivers data resets the count.
pub struct WsTransport {
    connector: Connector,
    reconnect: Option<RetryPolicy>,
}

impl WsTransport {
    pub fn new(endpoint: Url) -> Self {
        Self {
            connector: Connector {
                endpoint,
                ack_timeout: Duration::from_secs(10),
            },
            reconnect: Some(RetryPolicy::default()),
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.connector.ack_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// End subscriptions with [`TransportError::Closed`] when the socket drops.
    pub fn without_reconnect(mut self) -> Self {
        self.reconnect = None;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.connector.endpoint
    }

    pub fn reconnect_policy(&self) -> Option<&RetryPolicy> {
        self.reconnect.as_ref()
    }
}

async fn await_ack(source: &mut Source) -> Result<()> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                let msg: ServerMessage = serde_json::from_str(&text)?;
                match msg.kind.as_str() {
                    "connection_ack" => return Ok(()),
                    "connection_error" => {
                        return Err(protocol_error(format!(
                            "connection rejected: {}",
                            msg.payload
                        )));
                    }
                    _ => continue,
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Transport(TransportError::Closed));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ws_error(e)),
        }
    }
}

#[async_trait]
impl StreamExecutor for WsTransport {
    async fn subscribe(
        &self,
        request: &GraphqlRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, GraphqlResponse>> {
        let id = Uuid::new_v4().to_string();
        let start = json!({"id": id, "type": "start", "payload": request}).to_string();
        let (sink, source) = self.connector.open(&id, &start).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(supervise(
            Session {
                connector: self.connector.clone(),
                reconnect: self.reconnect.clone(),
                id,
                start,
                tx,
                cancel: cancel.clone(),
            },
            sink,
            source,
        ));

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .take_until(async move { cancel.cancelled().await });
        Ok(Box::pin(stream))
    }
}

/// Everything needed to (re)start one subscription.
struct Session {
    connector: Connector,
    reconnect: Option<RetryPolicy>,
    id: String,
    start: String,
    tx: mpsc::Sender<Result<GraphqlResponse>>,
    cancel: CancellationToken,
}

enum SessionEnd {
    /// Completed, failed for good, or abandoned by the consumer.
    Finished,
    /// The socket went away underneath an active subscription.
    Dropped { error: Error, delivered: bool },
}

async fn supervise(session: Session, mut sink: Sink, mut source: Source) {
    let mut failures = 0u32;
    loop {
        let mut error = match pump(sink, source, &session).await {
            SessionEnd::Finished => return,
            SessionEnd::Dropped { error, delivered } => {
                if delivered {
                    failures = 0;
                }
                error
            }
        };
        let Some(policy) = session.reconnect.as_ref() else {
            let _ = session.tx.send(Err(error)).await;
            return;
        };

        let reopened = loop {
            failures += 1;
            if failures >= policy.max_attempts {
                warn!(
                    subscription_id = session.id.as_str(),
                    attempts = failures,
                    error = %error,
                    "giving up on stream reconnection"
                );
                let _ = session.tx.send(Err(error)).await;
                return;
            }
            let delay = policy.backoff(failures - 1);
            warn!(
                subscription_id = session.id.as_str(),
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "stream dropped, reconnecting"
            );
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = session.tx.closed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match session.connector.open(&session.id, &session.start).await {
                Ok(pair) => break pair,
                Err(e) => error = e,
            }
        };
        (sink, source) = reopened;
    }
}

async fn pump(mut sink: Sink, mut source: Source, session: &Session) -> SessionEnd {
    let id = session.id.as_str();
    let tx = &session.tx;
    let mut completed = false;
    let mut delivered = false;
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = tx.closed() => break,
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let msg: ServerMessage = match serde_json::from_str(&text) {
                        Ok(m) => m,
                        Err(e) => {
                            let _ = tx.send(Err(Error::Serialization(e))).await;
                            break;
                        }
                    };
                    if msg.id.as_deref().is_some_and(|mid| mid != id) {
                        continue;
                    }
                    match msg.kind.as_str() {
                        "data" => {
                            let item = serde_json::from_value::<GraphqlResponse>(msg.payload)
                                .map_err(Error::Serialization);
                            if tx.send(item).await.is_err() {
                                break;
                            }
                            delivered = true;
                        }
                        "error" => {
                            let errors = payload_errors(msg.payload);
                            let _ = tx.send(Ok(GraphqlResponse::from_errors(errors))).await;
                            completed = true;
                            break;
                        }
                        "complete" => {
                            completed = true;
                            break;
                        }
                        "connection_error" => {
                            let _ = tx
                                .send(Err(protocol_error(format!("connection error: {}", msg.payload))))
                                .await;
                            completed = true;
                            break;
                        }
                        // "ka" and anything unknown
                        _ => continue,
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return SessionEnd::Dropped {
                        error: Error::Transport(TransportError::Closed),
                        delivered,
                    };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return SessionEnd::Dropped {
                        error: ws_error(e),
                        delivered,
                    };
                }
            }
        }
    }

    if !completed {
        let stop = json!({"id": id, "type": "stop"});
        if let Err(e) = sink.send(Message::Text(stop.to_string())).await {
            warn!(subscription_id = id, error = %e, "failed to send stop");
        }
    }
    let terminate = json!({"type": "connection_terminate"});
    let _ = sink.send(Message::Text(terminate.to_string())).await;
    let _ = sink.close().await;
    debug!(subscription_id = id, "subscription closed");
    SessionEnd::Finished
}

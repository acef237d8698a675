//! Request/response RPC client.
//!
//! [`RpcClient`] correlates outgoing requests with their eventual responses
//! by id.  Each in-flight request is a pending entry holding the caller's
//! oneshot sender; the entry is removed when the matching response arrives
//! or when the owning channel closes, in which case the request resolves as
//! failed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, TransportError};
use crate::framing::encode_frame;
use crate::jsonrpc::{Request, Response};

/// Client half of a duplex RPC channel.
///
/// Writes encoded frames into the `outgoing` channel; the transport owns the
/// task that moves them into the server's stdin.  Responses are fed back via
/// [`complete`](Self::complete) by the transport's reader.
pub struct RpcClient {
    next_id: AtomicI64,
    pending: DashMap<i64, oneshot::Sender<Result<Value>>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

impl RpcClient {
    /// Create a client that writes frames into `outgoing`.
    pub fn new(outgoing: mpsc::UnboundedSender<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            pending: DashMap::new(),
            outgoing,
        })
    }

    /// Send a request and await its response.
    ///
    /// Resolves with the server's `result` on success, with
    /// [`TransportError::Rpc`] when the server answers with an error object,
    /// and with [`TransportError::ChannelClosed`] when the channel dies
    /// before a response arrives.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = Request::with_id(id, method, params);
        let payload = serde_json::to_vec(&request)?;
        if self.outgoing.send(encode_frame(&payload)).is_err() {
            self.pending.remove(&id);
            return Err(TransportError::ChannelClosed);
        }
        tracing::trace!(id, method, "rpc request sent");

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ChannelClosed),
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let payload = serde_json::to_vec(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))?;
        self.outgoing
            .send(encode_frame(&payload))
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Deliver a response from the wire to its waiting caller.
    ///
    /// Unmatched responses are logged and dropped; the server may answer a
    /// request whose caller already gave up.
    pub fn complete(&self, response: Response) {
        let Some((_, tx)) = self.pending.remove(&response.id) else {
            tracing::debug!(id = response.id, "response without a pending request");
            return;
        };
        let result = match response.error {
            Some(error) => Err(TransportError::Rpc {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(result);
    }

    /// Answer a server-initiated request we do not implement.
    pub fn reject_server_request(&self, id: Value, method: &str) {
        tracing::debug!(%method, "rejecting unsupported server request");
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("method not supported: {method}") },
        });
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            let _ = self.outgoing.send(encode_frame(&bytes));
        }
    }

    /// Fail every pending request with [`TransportError::ChannelClosed`].
    ///
    /// Called by the transport when the session ends.
    pub fn fail_all_pending(&self) {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(TransportError::ChannelClosed));
            }
        }
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameDecoder;
    use crate::jsonrpc::{parse_incoming, Incoming};
    use serde_json::json;

    fn decode_one(frame_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Incoming {
        let frame = frame_rx.try_recv().expect("a frame must be queued");
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        let payload = decoder
            .next_frame()
            .expect("decode must succeed")
            .expect("frame must be complete");
        parse_incoming(&payload).expect("parse must succeed")
    }

    #[tokio::test]
    async fn request_resolves_with_result() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(tx);

        let fut = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request("ping", Some(json!({"n": 1}))).await })
        };
        tokio::task::yield_now().await;

        let Incoming::Request { id, .. } = decode_one(&mut rx) else {
            panic!("expected outgoing request");
        };
        let id = id.as_i64().expect("numeric id expected");
        client.complete(Response {
            id,
            result: Some(json!("pong")),
            error: None,
        });

        let result = fut.await.expect("task must not panic").expect("rpc ok");
        assert_eq!(result, json!("pong"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_resolves_with_rpc_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(tx);

        let fut = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request("nope", None).await })
        };
        tokio::task::yield_now().await;

        let Incoming::Request { id, .. } = decode_one(&mut rx) else {
            panic!("expected outgoing request");
        };
        client.complete(Response {
            id: id.as_i64().expect("numeric id expected"),
            result: None,
            error: Some(crate::jsonrpc::ErrorObject {
                code: -32601,
                message: "method not found".into(),
                data: None,
            }),
        });

        let result = fut.await.expect("task must not panic");
        assert!(matches!(
            result,
            Err(TransportError::Rpc { code: -32601, .. })
        ));
    }

    #[tokio::test]
    async fn closing_fails_all_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(tx);

        let fut = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request("slow", None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(client.pending_count(), 1);

        client.fail_all_pending();
        let result = fut.await.expect("task must not panic");
        assert!(matches!(result, Err(TransportError::ChannelClosed)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_on_dead_channel_fails_immediately() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let client = RpcClient::new(tx);
        let result = client.request("ping", None).await;
        assert!(matches!(result, Err(TransportError::ChannelClosed)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn notify_writes_a_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(tx);
        client
            .notify("initialized", Some(json!({})))
            .expect("notify must succeed");

        match decode_one(&mut rx) {
            Incoming::Notification(n) => assert_eq!(n.method, "initialized"),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_response_is_dropped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(tx);
        client.complete(Response {
            id: 999,
            result: Some(Value::Null),
            error: None,
        });
        assert_eq!(client.pending_count(), 0);
    }
}

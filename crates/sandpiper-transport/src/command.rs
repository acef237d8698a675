//! Protocol command encoder.
//!
//! The hosted server's native request language is line-oriented text.  A
//! structured [`Command`] is rendered into one line by interposing a
//! JSON-encoded string into a fixed template, then delivered as the payload
//! of the single custom RPC method [`COMMAND_METHOD`].
//!
//! The RPC response to that call is only an acknowledgement.  The real reply
//! arrives later as a server-initiated notification under the same method,
//! and the textual protocol carries no request identifier, so exact
//! correlation is impossible without protocol changes.  [`CommandChannel`]
//! therefore serializes submissions and matches replies to pending commands
//! in FIFO order; callers must not assume one-to-one call/reply framing
//! beyond that.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::client::RpcClient;
use crate::error::{Result, TransportError};
use crate::jsonrpc::Notification;

/// The custom RPC method carrying textual commands in both directions.
pub const COMMAND_METHOD: &str = "server/command";

/// Tag marking an outgoing command payload.
pub const COMMAND_TAG: &str = "CmdReq";

/// A structured command for the hosted server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Load (and typecheck) a file, by guest path.
    LoadFile {
        /// Guest-side path of the file.
        path: String,
    },

    /// Compile a file, by guest path.
    CompileFile {
        /// Guest-side path of the file.
        path: String,
    },

    /// Ask the server for its version banner.
    Version,
}

impl Command {
    /// Render the textual command line the server parses.
    pub fn to_line(&self) -> String {
        match self {
            Self::LoadFile { path } => format!("Cmd_load {} []", json_quote(path)),
            Self::CompileFile { path } => format!("Cmd_compile {} []", json_quote(path)),
            Self::Version => "Cmd_version".to_owned(),
        }
    }

    /// The RPC payload wrapping the command line.
    pub fn payload(&self) -> Value {
        serde_json::json!({ "tag": COMMAND_TAG, "contents": self.to_line() })
    }
}

/// JSON string encoding; infallible for strings.
fn json_quote(s: &str) -> String {
    Value::String(s.to_owned()).to_string()
}

/// Sends commands and correlates their asynchronous replies.
///
/// Submissions are serialized; the first reply notification under
/// [`COMMAND_METHOD`] answers the oldest pending command.  When the
/// underlying channel closes, every pending command resolves as failed.
pub struct CommandChannel {
    client: Arc<RpcClient>,
    pending: Arc<Mutex<VecDeque<oneshot::Sender<Value>>>>,
    submit: tokio::sync::Mutex<()>,
    dispatcher: JoinHandle<()>,
}

impl CommandChannel {
    /// Build a channel on top of an RPC client and its notification stream.
    pub fn new(
        client: Arc<RpcClient>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
    ) -> Self {
        let pending: Arc<Mutex<VecDeque<oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(VecDeque::new()));

        let dispatcher = tokio::spawn({
            let pending = Arc::clone(&pending);
            async move {
                while let Some(notification) = notifications.recv().await {
                    if notification.method != COMMAND_METHOD {
                        tracing::trace!(
                            method = %notification.method,
                            "ignoring non-command notification"
                        );
                        continue;
                    }
                    let reply = notification.params.unwrap_or(Value::Null);
                    let waiter = pending.lock().unwrap().pop_front();
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(reply);
                        }
                        None => tracing::debug!("command reply with no pending command"),
                    }
                }
                // Channel gone: dropping the senders fails the waiters.
                pending.lock().unwrap().clear();
            }
        });

        Self {
            client,
            pending,
            submit: tokio::sync::Mutex::new(()),
            dispatcher,
        }
    }

    /// Send a command and await its correlated reply.
    ///
    /// The returned value is the reply notification's payload, shaped by the
    /// server.  Fails with [`TransportError::ChannelClosed`] when the session
    /// ends before the reply arrives.
    pub async fn send(&self, command: &Command) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        {
            // Serialize the enqueue + submit pair so pending order matches
            // wire order.  The reply itself is awaited outside the guard.
            let _guard = self.submit.lock().await;
            self.pending.lock().unwrap().push_back(tx);

            let line = command.to_line();
            tracing::debug!(command = %line, "submitting command");
            if let Err(e) = self.client.request(COMMAND_METHOD, Some(command.payload())).await {
                // Our sender is still at the back unless the dispatcher
                // already consumed it for a stray reply.
                self.pending.lock().unwrap().pop_back();
                return Err(e);
            }
        }
        rx.await.map_err(|_| TransportError::ChannelClosed)
    }

    /// Number of commands still awaiting a reply.
    pub fn pending_commands(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameDecoder;
    use crate::jsonrpc::{parse_incoming, Incoming, Response};
    use serde_json::json;

    #[test]
    fn load_file_line_interposes_json_string() {
        let command = Command::LoadFile {
            path: "/workspace/src/Main.lang".into(),
        };
        assert_eq!(
            command.to_line(),
            r#"Cmd_load "/workspace/src/Main.lang" []"#
        );
    }

    #[test]
    fn line_escapes_special_characters() {
        let command = Command::LoadFile {
            path: "/workspace/we\"ird\\name".into(),
        };
        assert_eq!(command.to_line(), r#"Cmd_load "/workspace/we\"ird\\name" []"#);
    }

    #[test]
    fn payload_has_fixed_tag_and_contents() {
        let command = Command::Version;
        assert_eq!(
            command.payload(),
            json!({ "tag": "CmdReq", "contents": "Cmd_version" })
        );
    }

    /// Acks every outgoing command request so `send` can proceed to waiting
    /// for its reply notification.
    fn spawn_acker(client: Arc<RpcClient>, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            while let Some(frame) = frames.recv().await {
                decoder.push(&frame);
                while let Ok(Some(payload)) = decoder.next_frame() {
                    if let Ok(Incoming::Request { id, .. }) = parse_incoming(&payload) {
                        client.complete(Response {
                            id: id.as_i64().expect("numeric id expected"),
                            result: Some(json!({ "tag": "CmdAck" })),
                            error: None,
                        });
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn reply_notification_answers_the_command() {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(out_tx);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let channel = CommandChannel::new(Arc::clone(&client), notify_rx);
        spawn_acker(client, out_rx);

        let channel = Arc::new(channel);
        let send = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                channel
                    .send(&Command::LoadFile {
                        path: "/workspace/A.lang".into(),
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let reply = json!({ "tag": "CmdRes", "contents": "loaded" });
        notify_tx
            .send(Notification {
                method: COMMAND_METHOD.into(),
                params: Some(reply.clone()),
            })
            .expect("notify must succeed");

        let got = send
            .await
            .expect("task must not panic")
            .expect("send must succeed");
        assert_eq!(got, reply);
        assert_eq!(channel.pending_commands(), 0);
    }

    #[tokio::test]
    async fn replies_correlate_in_fifo_order() {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(out_tx);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(CommandChannel::new(Arc::clone(&client), notify_rx));
        spawn_acker(client, out_rx);

        let first = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                channel
                    .send(&Command::LoadFile {
                        path: "/workspace/First.lang".into(),
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        let second = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                channel
                    .send(&Command::LoadFile {
                        path: "/workspace/Second.lang".into(),
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        for n in 1..=2 {
            notify_tx
                .send(Notification {
                    method: COMMAND_METHOD.into(),
                    params: Some(json!({ "reply": n })),
                })
                .expect("notify must succeed");
        }

        let first = first.await.expect("no panic").expect("send must succeed");
        let second = second.await.expect("no panic").expect("send must succeed");
        assert_eq!(first, json!({ "reply": 1 }));
        assert_eq!(second, json!({ "reply": 2 }));
    }

    #[tokio::test]
    async fn non_command_notifications_are_ignored() {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(out_tx);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let channel = CommandChannel::new(Arc::clone(&client), notify_rx);
        spawn_acker(client, out_rx);

        let channel = Arc::new(channel);
        let send = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send(&Command::Version).await })
        };
        tokio::task::yield_now().await;

        notify_tx
            .send(Notification {
                method: "window/logMessage".into(),
                params: Some(json!({ "message": "noise" })),
            })
            .expect("notify must succeed");
        notify_tx
            .send(Notification {
                method: COMMAND_METHOD.into(),
                params: Some(json!({ "tag": "CmdRes" })),
            })
            .expect("notify must succeed");

        let got = send
            .await
            .expect("task must not panic")
            .expect("send must succeed");
        assert_eq!(got, json!({ "tag": "CmdRes" }));
    }

    #[tokio::test]
    async fn channel_close_fails_pending_commands() {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(out_tx);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let channel = CommandChannel::new(Arc::clone(&client), notify_rx);
        spawn_acker(client, out_rx);

        let channel = Arc::new(channel);
        let send = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send(&Command::Version).await })
        };
        // Let the command enqueue and get acked before the channel dies.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        drop(notify_tx);

        let result = send.await.expect("task must not panic");
        assert!(matches!(result, Err(TransportError::ChannelClosed)));
    }
}

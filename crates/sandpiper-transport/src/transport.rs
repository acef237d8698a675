//! Stdio transport adapter.
//!
//! [`ServerConnection`] wraps a server-mode [`ProcessHandle`] into the shape
//! an RPC client needs: a writer task serializing outgoing frames into the
//! stdin bridge and a reader task decoding frames from stdout and
//! dispatching them.  The connection owns the process for the lifetime of
//! the RPC session; closing it terminates the process.
//!
//! [`PathConverters`] translate `file:` URIs between the host's workspace
//! and the guest's `/workspace` mount for every location crossing the
//! boundary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use sandpiper_sandbox::{ProcessHandle, ProcessStatus, SharedSink, StdinWriter, GUEST_WORKSPACE};

use crate::client::RpcClient;
use crate::error::{Result, TransportError};
use crate::framing::FrameDecoder;
use crate::jsonrpc::{parse_incoming, Incoming, Notification};

/// Bidirectional URI translation between host and guest path spaces.
#[derive(Debug, Clone)]
pub struct PathConverters {
    host_root: PathBuf,
}

impl PathConverters {
    /// Create converters for a workspace rooted at `host_root`.
    pub fn new(host_root: impl Into<PathBuf>) -> Self {
        Self {
            host_root: host_root.into(),
        }
    }

    /// Map a host path inside the workspace to its guest path.
    ///
    /// Returns `None` for paths outside the workspace.
    pub fn host_path_to_guest(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.host_root).ok()?;
        let mut guest = String::from(GUEST_WORKSPACE);
        for component in rel.components() {
            guest.push('/');
            guest.push_str(component.as_os_str().to_str()?);
        }
        Some(guest)
    }

    /// Map a guest path under the workspace mount back to a host path.
    ///
    /// Returns `None` for guest paths outside [`GUEST_WORKSPACE`].
    pub fn guest_path_to_host(&self, path: &str) -> Option<PathBuf> {
        let rel = path.strip_prefix(GUEST_WORKSPACE)?;
        Some(self.host_root.join(rel.trim_start_matches('/')))
    }

    /// Translate a host `file:` URI into guest space.
    ///
    /// Non-file URIs and file URIs outside the workspace pass through
    /// unchanged.
    pub fn host_to_guest(&self, uri: &Url) -> Result<Url> {
        if uri.scheme() != "file" {
            return Ok(uri.clone());
        }
        let host_path = uri
            .to_file_path()
            .map_err(|_| TransportError::Uri(format!("not a local file uri: {uri}")))?;
        match self.host_path_to_guest(&host_path) {
            Some(guest) => Url::parse(&format!("file://{guest}"))
                .map_err(|e| TransportError::Uri(e.to_string())),
            None => Ok(uri.clone()),
        }
    }

    /// Translate a guest `file:` URI back into host space.
    pub fn guest_to_host(&self, uri: &Url) -> Result<Url> {
        if uri.scheme() != "file" {
            return Ok(uri.clone());
        }
        match self.guest_path_to_host(uri.path()) {
            Some(host_path) => Url::from_file_path(&host_path).map_err(|_| {
                TransportError::Uri(format!("cannot build file uri for {}", host_path.display()))
            }),
            None => Ok(uri.clone()),
        }
    }
}

/// Duplex RPC channel over a server process's stdio.
pub struct ServerConnection {
    client: Arc<RpcClient>,
    notifications: Option<mpsc::UnboundedReceiver<Notification>>,
    handle: ProcessHandle,
    converters: PathConverters,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl ServerConnection {
    /// Take ownership of a spawned server process and wire its stdio into an
    /// RPC channel.
    ///
    /// `stdin` must be the writer half of the bridge the process was spawned
    /// with.  Guest stderr is forwarded to `sink` as it arrives.
    pub fn new(
        mut handle: ProcessHandle,
        stdin: StdinWriter,
        converters: PathConverters,
        sink: SharedSink,
    ) -> Result<Self> {
        let stdout_rx = handle
            .take_stdout()
            .ok_or_else(|| TransportError::Stream("stdout stream already taken".into()))?;
        let stderr_rx = handle
            .take_stderr()
            .ok_or_else(|| TransportError::Stream("stderr stream already taken".into()))?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let client = RpcClient::new(outgoing_tx);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let writer_task = tokio::spawn(write_frames(outgoing_rx, stdin));
        let reader_task = tokio::spawn(read_frames(stdout_rx, Arc::clone(&client), notify_tx));
        let stderr_task = tokio::spawn(forward_stderr(stderr_rx, sink));

        Ok(Self {
            client,
            notifications: Some(notify_rx),
            handle,
            converters,
            writer_task,
            reader_task,
            stderr_task,
        })
    }

    /// The RPC client bound to this connection.
    pub fn client(&self) -> Arc<RpcClient> {
        Arc::clone(&self.client)
    }

    /// Take the stream of server-initiated notifications.
    pub fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.notifications.take()
    }

    /// The URI converters for this session's workspace.
    pub fn converters(&self) -> &PathConverters {
        &self.converters
    }

    /// Current state of the underlying process.
    pub fn status(&self) -> ProcessStatus {
        self.handle.status()
    }

    /// Await the process's terminal state without closing the session.
    pub async fn wait(&mut self) -> ProcessStatus {
        self.handle.wait().await
    }

    /// Close the session: terminate the process and await its final state.
    pub async fn close(mut self) -> ProcessStatus {
        self.handle.kill();
        self.handle.wait().await
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        // The session owns the process; never leave it running behind us.
        self.handle.kill();
        self.writer_task.abort();
        self.reader_task.abort();
        self.stderr_task.abort();
        self.client.fail_all_pending();
    }
}

async fn write_frames(mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>, stdin: StdinWriter) {
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = stdin.write(&frame) {
            tracing::warn!(error = %e, "failed to write frame to server stdin");
            break;
        }
    }
    // No more outgoing traffic: signal end-of-input to the guest.
    stdin.close();
}

async fn read_frames(
    mut stdout: mpsc::UnboundedReceiver<bytes::Bytes>,
    client: Arc<RpcClient>,
    notify_tx: mpsc::UnboundedSender<Notification>,
) {
    let mut decoder = FrameDecoder::new();
    'session: while let Some(chunk) = stdout.recv().await {
        decoder.push(&chunk);
        loop {
            match decoder.next_frame() {
                Ok(Some(payload)) => match parse_incoming(&payload) {
                    Ok(Incoming::Response(response)) => client.complete(response),
                    Ok(Incoming::Notification(notification)) => {
                        let _ = notify_tx.send(notification);
                    }
                    Ok(Incoming::Request { id, method }) => {
                        client.reject_server_request(id, &method);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "unparsable rpc frame, closing session");
                        break 'session;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    // No resynchronization marker in the protocol: close.
                    tracing::error!(error = %e, "stream error on rpc transport, closing session");
                    break 'session;
                }
            }
        }
    }
    client.fail_all_pending();
}

async fn forward_stderr(mut stderr: mpsc::UnboundedReceiver<bytes::Bytes>, sink: SharedSink) {
    while let Some(chunk) = stderr.recv().await {
        sink.stderr_chunk(&chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converters() -> PathConverters {
        PathConverters::new("/srv/project")
    }

    #[test]
    fn host_path_maps_into_workspace() {
        let c = converters();
        let guest = c.host_path_to_guest(Path::new("/srv/project/src/Main.lang"));
        assert_eq!(guest.as_deref(), Some("/workspace/src/Main.lang"));
    }

    #[test]
    fn host_path_outside_workspace_is_none() {
        let c = converters();
        assert!(c.host_path_to_guest(Path::new("/etc/passwd")).is_none());
    }

    #[test]
    fn guest_path_maps_back_to_host() {
        let c = converters();
        let host = c.guest_path_to_host("/workspace/src/Main.lang");
        assert_eq!(host, Some(PathBuf::from("/srv/project/src/Main.lang")));
    }

    #[test]
    fn guest_path_outside_mount_is_none() {
        let c = converters();
        assert!(c.guest_path_to_host("/tmp/scratch").is_none());
    }

    #[test]
    fn uri_round_trip_through_guest_space() {
        let c = converters();
        let host_uri = Url::parse("file:///srv/project/src/Main.lang").expect("valid uri");

        let guest_uri = c.host_to_guest(&host_uri).expect("translation must succeed");
        assert_eq!(guest_uri.as_str(), "file:///workspace/src/Main.lang");

        let back = c.guest_to_host(&guest_uri).expect("translation must succeed");
        assert_eq!(back, host_uri);
    }

    #[test]
    fn non_file_uris_pass_through() {
        let c = converters();
        let uri = Url::parse("untitled:Untitled-1").expect("valid uri");
        assert_eq!(c.host_to_guest(&uri).expect("must succeed"), uri);
        assert_eq!(c.guest_to_host(&uri).expect("must succeed"), uri);
    }

    #[test]
    fn file_uri_outside_workspace_passes_through() {
        let c = converters();
        let uri = Url::parse("file:///usr/lib/prelude.lang").expect("valid uri");
        assert_eq!(c.host_to_guest(&uri).expect("must succeed"), uri);
    }
}

//! Process supervisor.
//!
//! [`Supervisor`] spawns sandboxed processes from compiled modules with a
//! given mount table, stdio wiring, environment, and argument vector.  Two
//! modes are supported: run-to-completion (collect output, await the exit
//! code) and run-as-server (return a live [`ProcessHandle`] for streaming).
//!
//! The guest executes on the host's async scheduler with epoch interruption:
//! it cooperatively yields back to the event loop between epochs, which is
//! also what makes [`ProcessHandle::kill`] a clean cancellation point rather
//! than a blocked thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use wasmtime::{
    Engine, Linker, MemoryType, Module, SharedMemory, Store, StoreLimits, StoreLimitsBuilder,
};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{
    DirPerms, FilePerms, HostOutputStream, I32Exit, StdoutStream, StreamError, StreamResult,
    Subscribe, WasiCtxBuilder,
};

use crate::error::{Result, SandboxError};
use crate::mounts::{MountPoint, MountTable, GUEST_WORKSPACE};
use crate::pipe::StdinBridge;
use crate::sink::SharedSink;

/// Size of one wasm linear-memory page.
const WASM_PAGE_SIZE: usize = 64 * 1024;

/// How often the epoch ticker forces a guest yield.
const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Bytes the guest may write per stdout/stderr flush before re-polling.
const CHUNK_WRITE_BUDGET: usize = 64 * 1024;

/// Abort-style exit code reported when the guest traps instead of exiting.
const TRAP_EXIT_CODE: i32 = 134;

/// Linear-memory bounds for a spawned process.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    /// Initial size of the guest memory, in pages.
    pub initial_pages: u32,
    /// Maximum size the guest memory may grow to, in pages.
    pub maximum_pages: u32,
    /// Whether the module imports a shared (threaded) memory the host must
    /// provide.
    pub shared: bool,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            initial_pages: 256,
            maximum_pages: 1024,
            shared: false,
        }
    }
}

/// Everything a spawn needs.  Immutable once passed to
/// [`Supervisor::spawn`].
#[derive(Default)]
pub struct ProcessConfig {
    memory: MemoryLimits,
    env: Vec<(String, String)>,
    args: Vec<String>,
    mounts: MountTable,
    stdin: Option<StdinBridge>,
    trace_enabled: bool,
}

impl ProcessConfig {
    /// Create a configuration with default limits and no mounts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory limits.
    pub fn with_memory(mut self, memory: MemoryLimits) -> Self {
        self.memory = memory;
        self
    }

    /// Add an environment variable visible to the guest.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Set the argument vector (not counting `argv[0]`, which is the process
    /// name).  Arguments are forwarded verbatim and never interpreted.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Attach a mount table.
    pub fn with_mounts(mut self, mounts: MountTable) -> Self {
        self.mounts = mounts;
        self
    }

    /// Wire the guest's stdin to a [`StdinBridge`].
    pub fn with_stdin(mut self, stdin: StdinBridge) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Enable stdio chunk tracing for this process.
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_enabled = enabled;
        self
    }
}

/// Lifecycle state of a spawned process.
///
/// Transitions are `Created -> Running -> {Exited | Killed}`; at most one
/// terminal transition occurs, and repeated status reads after it agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Spawned but not yet scheduled.
    Created,
    /// Executing on the host scheduler.
    Running,
    /// The guest exited with the given code, reported verbatim.
    Exited(i32),
    /// The host terminated the process.
    Killed,
}

impl ProcessStatus {
    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed)
    }
}

/// Captured output of a run-to-completion invocation.
#[derive(Debug, Clone)]
pub struct CompletedProcess {
    /// Accumulated stdout bytes, in emission order.
    pub stdout: Vec<u8>,
    /// Accumulated stderr bytes, in emission order.
    pub stderr: Vec<u8>,
    /// The guest's exit code, reported verbatim.  Non-zero is not an error
    /// at this layer.
    pub exit_code: i32,
}

impl CompletedProcess {
    /// Stdout decoded lossily as UTF-8.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily as UTF-8.
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Owning handle to a running sandboxed process.
///
/// Exposes live stdout/stderr chunk streams while running and the terminal
/// state once finished.  The handle is exclusively owned by the component
/// that spawned the process.
pub struct ProcessHandle {
    name: String,
    status: watch::Receiver<ProcessStatus>,
    kill: watch::Sender<bool>,
    stdout: Option<mpsc::UnboundedReceiver<Bytes>>,
    stderr: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl ProcessHandle {
    /// The process name (`argv[0]`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    /// Take the stdout chunk stream.  Chunks preserve emission order within
    /// the stream; stdout and stderr have no guaranteed interleaving.
    pub fn take_stdout(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.stdout.take()
    }

    /// Take the stderr chunk stream.
    pub fn take_stderr(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.stderr.take()
    }

    /// Request termination.  A no-op once the process is already terminal,
    /// so a kill racing a natural exit never overwrites `Exited`.
    pub fn kill(&self) {
        if self.status().is_terminal() {
            return;
        }
        let _ = self.kill.send(true);
    }

    /// Await the terminal state.
    pub async fn wait(&mut self) -> ProcessStatus {
        let waited = self
            .status
            .wait_for(ProcessStatus::is_terminal)
            .await
            .map(|status| *status);
        match waited {
            Ok(status) => status,
            // The run task never drops the sender before publishing a
            // terminal state, but don't panic if it somehow did.
            Err(_) => *self.status.borrow(),
        }
    }
}

/// Stdout/stderr endpoint that forwards each guest write as one chunk.
struct ChunkPipe {
    tx: mpsc::UnboundedSender<Bytes>,
    label: &'static str,
    trace: bool,
}

impl ChunkPipe {
    fn new(label: &'static str, trace: bool) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, label, trace }, rx)
    }
}

impl StdoutStream for ChunkPipe {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(ChunkStream {
            tx: self.tx.clone(),
            label: self.label,
            trace: self.trace,
        })
    }

    fn isatty(&self) -> bool {
        false
    }
}

struct ChunkStream {
    tx: mpsc::UnboundedSender<Bytes>,
    label: &'static str,
    trace: bool,
}

#[async_trait]
impl Subscribe for ChunkStream {
    async fn ready(&mut self) {}
}

impl HostOutputStream for ChunkStream {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if self.trace {
            tracing::trace!(stream = self.label, len = bytes.len(), "guest output chunk");
        }
        self.tx.send(bytes).map_err(|_| StreamError::Closed)
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(CHUNK_WRITE_BUDGET)
    }
}

/// Host state stored in the wasmtime [`Store`] for each process.
struct GuestState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
}

/// Spawns sandboxed processes on a shared engine.
pub struct Supervisor {
    engine: Engine,
    sink: SharedSink,
}

impl Supervisor {
    /// Create a supervisor.  The engine must be the one the modules were
    /// compiled against (see
    /// [`ModuleLoader::engine`](crate::loader::ModuleLoader::engine)).
    pub fn new(engine: Engine, sink: SharedSink) -> Self {
        Self { engine, sink }
    }

    /// Spawn `module` as a live process.
    ///
    /// Fails with [`SandboxError::Creation`] if the mount table cannot be
    /// staged and attached, and with [`SandboxError::Spawn`] if the module
    /// cannot be instantiated or lacks a command entrypoint.  On success the
    /// returned handle owns the process; output streams are live
    /// immediately.
    pub async fn spawn(
        &self,
        name: &str,
        module: &Module,
        config: ProcessConfig,
    ) -> Result<ProcessHandle> {
        let ProcessConfig {
            memory,
            env,
            args,
            mounts,
            stdin,
            trace_enabled,
        } = config;

        let mut staged: Vec<tempfile::TempDir> = Vec::new();
        let mut builder = WasiCtxBuilder::new();

        for mount in mounts.mounts() {
            Self::attach_mount(&mut builder, mount, &mut staged)?;
        }

        for (key, value) in &env {
            builder.env(key, value);
        }

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(name.to_owned());
        argv.extend(args);
        builder.args(&argv);

        if let Some(bridge) = stdin {
            builder.stdin(bridge);
        }
        let (stdout_pipe, stdout_rx) = ChunkPipe::new("stdout", trace_enabled);
        let (stderr_pipe, stderr_rx) = ChunkPipe::new("stderr", trace_enabled);
        builder.stdout(stdout_pipe);
        builder.stderr(stderr_pipe);

        let wasi = builder.build_p1();
        let limits = StoreLimitsBuilder::new()
            .memory_size(memory.maximum_pages as usize * WASM_PAGE_SIZE)
            .build();

        let mut store = Store::new(&self.engine, GuestState { wasi, limits });
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(1);
        store.epoch_deadline_async_yield_and_update(1);

        let mut linker: Linker<GuestState> = Linker::new(&self.engine);
        preview1::add_to_linker_async(&mut linker, |state: &mut GuestState| &mut state.wasi)
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        if memory.shared {
            let ty = MemoryType::shared(memory.initial_pages, memory.maximum_pages);
            let shared_memory = SharedMemory::new(&self.engine, ty)
                .map_err(|e| SandboxError::Spawn(format!("shared memory setup failed: {e}")))?;
            linker
                .define(&mut store, "env", "memory", shared_memory)
                .map_err(|e| SandboxError::Spawn(e.to_string()))?;
        }

        let instance = linker
            .instantiate_async(&mut store, module)
            .await
            .map_err(|e| SandboxError::Spawn(format!("instantiation failed: {e}")))?;
        let start = instance
            .get_typed_func::<(), ()>(&mut store, "_start")
            .map_err(|e| SandboxError::Spawn(format!("module has no _start export: {e}")))?;

        tracing::debug!(
            process = name,
            args = ?argv,
            mounts = mounts.mounts().len(),
            trace = trace_enabled,
            "spawning sandboxed process"
        );

        let (status_tx, status_rx) = watch::channel(ProcessStatus::Created);
        let (kill_tx, mut kill_rx) = watch::channel(false);

        // The epoch ticker is what makes the guest yield back to the host
        // scheduler.  It runs on a dedicated OS thread so it keeps ticking
        // even while the event loop is inside a guest execution slice; it
        // stops with the process.
        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker_engine = self.engine.clone();
        {
            let stop = Arc::clone(&ticker_stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    ticker_engine.increment_epoch();
                }
            });
        }

        let sink = Arc::clone(&self.sink);
        let process_name = name.to_owned();
        tokio::spawn(async move {
            // Staged memory-filesystem directories must outlive the guest.
            let _staged = staged;

            let _ = status_tx.send(ProcessStatus::Running);

            let outcome = tokio::select! {
                result = start.call_async(&mut store, ()) => Some(result),
                _ = killed(&mut kill_rx) => None,
            };
            ticker_stop.store(true, Ordering::Relaxed);

            let status = match outcome {
                None => ProcessStatus::Killed,
                Some(Ok(())) => ProcessStatus::Exited(0),
                Some(Err(e)) => match e.downcast_ref::<I32Exit>() {
                    Some(exit) => ProcessStatus::Exited(exit.0),
                    None => {
                        tracing::error!(process = %process_name, error = %e, "guest trapped");
                        ProcessStatus::Exited(TRAP_EXIT_CODE)
                    }
                },
            };
            sink.status(&process_name, status);
            let _ = status_tx.send(status);
        });

        Ok(ProcessHandle {
            name: name.to_owned(),
            status: status_rx,
            kill: kill_tx,
            stdout: Some(stdout_rx),
            stderr: Some(stderr_rx),
        })
    }

    /// Run `module` to completion with the given arguments and no mounts,
    /// capturing all output.
    ///
    /// The exit code is surfaced verbatim; interpreting a non-zero code is
    /// the caller's concern.
    pub async fn run_to_completion(
        &self,
        name: &str,
        module: &Module,
        args: &[String],
    ) -> Result<CompletedProcess> {
        let config = ProcessConfig::new().with_args(args.to_vec());
        let mut handle = self.spawn(name, module, config).await?;

        let stdout_rx = handle
            .take_stdout()
            .ok_or_else(|| SandboxError::Spawn("stdout stream unavailable".into()))?;
        let stderr_rx = handle
            .take_stderr()
            .ok_or_else(|| SandboxError::Spawn("stderr stream unavailable".into()))?;

        let (stdout, stderr, status) =
            tokio::join!(drain(stdout_rx), drain(stderr_rx), handle.wait());

        match status {
            ProcessStatus::Exited(exit_code) => Ok(CompletedProcess {
                stdout,
                stderr,
                exit_code,
            }),
            other => Err(SandboxError::Trap(format!(
                "process '{name}' ended in unexpected state {other:?}"
            ))),
        }
    }

    fn attach_mount(
        builder: &mut WasiCtxBuilder,
        mount: &MountPoint,
        staged: &mut Vec<tempfile::TempDir>,
    ) -> Result<()> {
        match mount {
            MountPoint::Workspace { host_dir } => {
                builder
                    .preopened_dir(host_dir, GUEST_WORKSPACE, DirPerms::all(), FilePerms::all())
                    .map_err(|e| {
                        SandboxError::Creation(format!(
                            "failed to attach workspace {}: {e}",
                            host_dir.display()
                        ))
                    })?;
            }
            MountPoint::Memory { fs, guest_path } => {
                let dir = tempfile::Builder::new()
                    .prefix("sandpiper-memfs-")
                    .tempdir()
                    .map_err(|e| {
                        SandboxError::Creation(format!("failed to create staging dir: {e}"))
                    })?;
                fs.stage(dir.path()).map_err(|e| {
                    SandboxError::Creation(format!(
                        "failed to stage memory filesystem for {guest_path}: {e}"
                    ))
                })?;
                builder
                    .preopened_dir(dir.path(), guest_path, DirPerms::all(), FilePerms::all())
                    .map_err(|e| {
                        SandboxError::Creation(format!("failed to attach {guest_path}: {e}"))
                    })?;
                staged.push(dir);
            }
            MountPoint::Host {
                host_dir,
                guest_path,
            } => {
                builder
                    .preopened_dir(host_dir, guest_path, DirPerms::all(), FilePerms::all())
                    .map_err(|e| {
                        SandboxError::Creation(format!("failed to attach {guest_path}: {e}"))
                    })?;
            }
        }
        Ok(())
    }
}

/// Resolves once a kill has been requested.
async fn killed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            // Sender gone without a kill: park forever, the select's other
            // branch decides the outcome.
            std::future::pending::<()>().await;
        }
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Bytes>) -> Vec<u8> {
    let mut buf = Vec::new();
    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
    }
    buf
}

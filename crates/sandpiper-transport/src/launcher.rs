//! Server assembly.
//!
//! [`ServerLauncher`] wires the sandbox pieces together: it builds the mount
//! table, creates the stdin bridge, spawns the module in server mode with
//! the fixed environment and pass-through arguments, and wraps the process
//! in a [`ServerSession`].  One parameterized [`HostProfile`] drives every
//! behavior variant.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use wasmtime::{Engine, Module};

use sandpiper_sandbox::{
    MemoryFs, MemoryLimits, MountTable, ProcessConfig, ProcessStatus, SharedSink, StdinBridge,
    Supervisor, GUEST_HOME,
};

use crate::command::{Command, CommandChannel};
use crate::error::{Result, TransportError};
use crate::transport::{PathConverters, ServerConnection};

/// Process name the hosted server runs under (`argv[0]`).
pub const SERVER_PROCESS_NAME: &str = "server";

/// Default guest path of the server's data directory mount.
pub const GUEST_DATA_DIR: &str = "/opt/sandpiper";

/// Environment variable naming the data directory for the guest.
pub const DATA_DIR_ENV: &str = "SERVER_DATA_DIR";

/// Environment variable naming the guest home directory.
pub const HOME_ENV: &str = "HOME";

/// The single configuration structure enumerating every hosting variant.
#[derive(Debug, Clone)]
pub struct HostProfile {
    /// Mount a private scratch filesystem at `/tmp`.
    pub include_temp_mount: bool,

    /// Trace stdio chunks of the hosted process.
    pub trace_enabled: bool,

    /// Location of the server module on disk; `None` means the caller
    /// resolves a built-in module itself.
    pub module_path: Option<PathBuf>,

    /// Host files to load into the server right after launch.
    pub warmup_files: Vec<PathBuf>,

    /// Guest path the data directory is mounted at.
    pub data_guest_path: String,

    /// Name of the environment variable pointing the guest at the data
    /// directory.
    pub data_env_name: String,

    /// Runtime-tuning flags forwarded verbatim to the hosted server.
    pub runtime_args: Vec<String>,

    /// Flags suppressing the server's duplicate-interface-file warning,
    /// forwarded verbatim.
    pub warning_args: Vec<String>,

    /// Linear-memory limits for the server process.
    pub memory: MemoryLimits,
}

impl Default for HostProfile {
    fn default() -> Self {
        Self {
            include_temp_mount: true,
            trace_enabled: false,
            module_path: None,
            warmup_files: Vec::new(),
            data_guest_path: GUEST_DATA_DIR.to_owned(),
            data_env_name: DATA_DIR_ENV.to_owned(),
            runtime_args: vec!["+RTS".to_owned(), "-V1".to_owned(), "-RTS".to_owned()],
            warning_args: vec!["-WnoDuplicateInterfaceFiles".to_owned()],
            memory: MemoryLimits::default(),
        }
    }
}

impl HostProfile {
    /// Create a profile with the default variant.
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle the scratch mount.
    pub fn with_temp_mount(mut self, include: bool) -> Self {
        self.include_temp_mount = include;
        self
    }

    /// Toggle stdio tracing.
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_enabled = enabled;
        self
    }

    /// Set the module path.
    pub fn with_module_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.module_path = Some(path.into());
        self
    }

    /// Set the files loaded right after launch.
    pub fn with_warmup_files(mut self, files: Vec<PathBuf>) -> Self {
        self.warmup_files = files;
        self
    }

    /// Set the memory limits.
    pub fn with_memory(mut self, memory: MemoryLimits) -> Self {
        self.memory = memory;
        self
    }
}

/// A hosted server: the RPC session plus its command channel.
pub struct ServerSession {
    connection: ServerConnection,
    commands: CommandChannel,
}

impl ServerSession {
    /// The command channel for the hosted server's textual protocol.
    pub fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    /// The underlying RPC connection.
    pub fn connection(&self) -> &ServerConnection {
        &self.connection
    }

    /// The session's URI converters.
    pub fn converters(&self) -> &PathConverters {
        self.connection.converters()
    }

    /// Current state of the server process.
    pub fn status(&self) -> ProcessStatus {
        self.connection.status()
    }

    /// Await the server process's terminal state.
    pub async fn wait(&mut self) -> ProcessStatus {
        self.connection.wait().await
    }

    /// Load each host file into the server, sequentially.
    ///
    /// Files must live inside the workspace; replies are returned in order.
    pub async fn warm_up(&self, files: &[PathBuf]) -> Result<Vec<Value>> {
        let mut replies = Vec::with_capacity(files.len());
        for file in files {
            let guest = self
                .connection
                .converters()
                .host_path_to_guest(file)
                .ok_or_else(|| {
                    TransportError::Uri(format!("{} is outside the workspace", file.display()))
                })?;
            let reply = self.commands.send(&Command::LoadFile { path: guest }).await?;
            replies.push(reply);
        }
        Ok(replies)
    }

    /// End the session and await the process's terminal state.
    pub async fn close(self) -> ProcessStatus {
        let Self {
            connection,
            commands,
        } = self;
        drop(commands);
        connection.close().await
    }
}

/// Builds server sessions from a profile.
pub struct ServerLauncher {
    supervisor: Supervisor,
    profile: HostProfile,
    sink: SharedSink,
}

impl ServerLauncher {
    /// Create a launcher.  `engine` must be the engine the server module was
    /// compiled against.
    pub fn new(engine: Engine, profile: HostProfile, sink: SharedSink) -> Self {
        let supervisor = Supervisor::new(engine, Arc::clone(&sink));
        Self {
            supervisor,
            profile,
            sink,
        }
    }

    /// The active profile.
    pub fn profile(&self) -> &HostProfile {
        &self.profile
    }

    /// Spawn `module` as a long-lived server over `workspace_dir`.
    ///
    /// `data_fs` is the pre-seeded data directory tree; provisioning its
    /// contents is the caller's concern.  The guest always sees the two
    /// fixed environment variables (`HOME` and the data directory variable)
    /// pointing at its private mounts.
    pub async fn launch(
        &self,
        module: &Module,
        workspace_dir: &Path,
        data_fs: MemoryFs,
    ) -> Result<ServerSession> {
        let mounts = MountTable::for_server(
            workspace_dir,
            &self.profile.data_guest_path,
            data_fs,
            self.profile.include_temp_mount,
        )?;

        let (bridge, writer) = StdinBridge::new();

        let mut args = self.profile.runtime_args.clone();
        args.extend(self.profile.warning_args.iter().cloned());

        let config = ProcessConfig::new()
            .with_memory(self.profile.memory)
            .with_env(HOME_ENV, GUEST_HOME)
            .with_env(
                self.profile.data_env_name.as_str(),
                self.profile.data_guest_path.as_str(),
            )
            .with_args(args)
            .with_mounts(mounts)
            .with_stdin(bridge)
            .with_trace(self.profile.trace_enabled);

        let handle = self
            .supervisor
            .spawn(SERVER_PROCESS_NAME, module, config)
            .await?;

        tracing::info!(
            workspace = %workspace_dir.display(),
            data_dir = %self.profile.data_guest_path,
            "language server spawned"
        );

        let converters = PathConverters::new(workspace_dir);
        let mut connection =
            ServerConnection::new(handle, writer, converters, Arc::clone(&self.sink))?;
        let notifications = connection
            .take_notifications()
            .ok_or_else(|| TransportError::Stream("notification stream already taken".into()))?;
        let commands = CommandChannel::new(connection.client(), notifications);

        Ok(ServerSession {
            connection,
            commands,
        })
    }

    /// Run the module to completion with `--version` and return the trimmed
    /// banner it prints.
    pub async fn query_version(&self, module: &Module) -> Result<String> {
        let completed = self
            .supervisor
            .run_to_completion(SERVER_PROCESS_NAME, module, &["--version".to_owned()])
            .await?;
        Ok(completed.stdout_text().trim_end().to_owned())
    }
}

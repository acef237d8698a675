//! CLI argument definitions for sandpiper.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Sandpiper -- hosts a language server compiled to a sandboxed wasm module.
#[derive(Parser)]
#[command(
    name = "sandpiper",
    version,
    about = "Sandpiper -- sandboxed language-server host",
    long_about = "Runs a language server compiled to WebAssembly inside a WASI sandbox, \
                  bridging its stdio into a JSON-RPC session over the workspace."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Host the server over a workspace until it exits or is interrupted.
    Run {
        /// The server module to load.
        #[arg(long, default_value = "server.wasm")]
        module: PathBuf,

        /// Workspace directory exposed to the guest at /workspace.
        #[arg(long, short, default_value = ".")]
        workspace: PathBuf,

        /// Host directory whose contents seed the guest's data mount.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Files (inside the workspace) to load right after launch.
        #[arg(long = "load")]
        warmup_files: Vec<PathBuf>,

        /// Trace stdio chunks of the hosted process.
        #[arg(long)]
        trace: bool,

        /// Skip the private /tmp mount.
        #[arg(long)]
        no_temp_mount: bool,
    },

    /// Print the server module's version banner.
    Version {
        /// The server module to query.
        #[arg(long, default_value = "server.wasm")]
        module: PathBuf,
    },

    /// Show host status (module present, workspace sanity).
    Status {
        /// The server module to check for.
        #[arg(long, default_value = "server.wasm")]
        module: PathBuf,

        /// Workspace directory to check.
        #[arg(long, short, default_value = ".")]
        workspace: PathBuf,
    },
}

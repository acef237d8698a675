//! CLI entry point for sandpiper.
//!
//! This binary provides the `sandpiper` command with subcommands for hosting
//! the server, querying its version, and checking host status.

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use sandpiper_sandbox::{MemoryFs, ModuleLoader, TracingSink};
use sandpiper_transport::{HostProfile, ServerLauncher};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            module,
            workspace,
            data_dir,
            warmup_files,
            trace,
            no_temp_mount,
        } => {
            cmd_run(
                module,
                workspace,
                data_dir,
                warmup_files,
                trace,
                no_temp_mount,
            )
            .await
        }
        Commands::Version { module } => cmd_version(module).await,
        Commands::Status { module, workspace } => cmd_status(&module, &workspace),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(
    module_path: PathBuf,
    workspace: PathBuf,
    data_dir: Option<PathBuf>,
    warmup_files: Vec<PathBuf>,
    trace: bool,
    no_temp_mount: bool,
) -> Result<()> {
    init_tracing("info");

    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("workspace {} is not accessible", workspace.display()))?;

    // 1. Seed the data mount from the host directory, if given.
    let data_fs = match &data_dir {
        Some(dir) => seed_data_fs(dir)
            .with_context(|| format!("failed to read data directory {}", dir.display()))?,
        None => MemoryFs::new(),
    };
    info!(files = data_fs.len(), "data mount prepared");

    // 2. Compile the server module.
    let mut loader = ModuleLoader::new().context("failed to initialize the sandbox")?;
    let module = loader
        .load_file("server", &module_path)
        .await
        .with_context(|| format!("failed to load server module {}", module_path.display()))?;

    // 3. Launch the session.
    let profile = HostProfile::new()
        .with_temp_mount(!no_temp_mount)
        .with_trace(trace)
        .with_module_path(&module_path)
        .with_warmup_files(warmup_files);

    let launcher = ServerLauncher::new(loader.engine().clone(), profile, Arc::new(TracingSink));
    let mut session = launcher
        .launch(&module, &workspace, data_fs)
        .await
        .context("failed to launch the language server")?;
    info!(workspace = %workspace.display(), "language server session started");

    // 4. Warm up requested files.
    let warmup = launcher.profile().warmup_files.clone();
    if !warmup.is_empty() {
        let replies = session
            .warm_up(&warmup)
            .await
            .context("warm-up command failed")?;
        info!(loaded = replies.len(), "warm-up complete");
    }

    // 5. Run until the server exits or the user interrupts.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        status = session.wait() => {
            info!(?status, "language server exited");
            return Ok(());
        }
    }

    let status = session.close().await;
    info!(?status, "language server stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: version
// ---------------------------------------------------------------------------

async fn cmd_version(module_path: PathBuf) -> Result<()> {
    init_tracing("warn");

    let mut loader = ModuleLoader::new().context("failed to initialize the sandbox")?;
    let module = loader
        .load_file("server", &module_path)
        .await
        .with_context(|| format!("failed to load server module {}", module_path.display()))?;

    let launcher = ServerLauncher::new(
        loader.engine().clone(),
        HostProfile::default(),
        Arc::new(TracingSink),
    );
    let banner = launcher
        .query_version(&module)
        .await
        .context("version query failed")?;

    println!("{banner}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

fn cmd_status(module_path: &Path, workspace: &Path) -> Result<()> {
    init_tracing("warn");

    println!();
    println!("  Sandpiper Status");
    println!("  ================");
    println!();

    if module_path.is_file() {
        println!("  Server module:    OK ({})", module_path.display());
    } else {
        println!(
            "  Server module:    MISSING ({})",
            module_path.display()
        );
    }

    if workspace.is_dir() {
        println!("  Workspace:        OK ({})", workspace.display());
    } else {
        println!("  Workspace:        NOT A DIRECTORY ({})", workspace.display());
    }

    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Read every file under `dir` into a [`MemoryFs`], keyed by relative path.
fn seed_data_fs(dir: &Path) -> std::io::Result<MemoryFs> {
    fn walk(fs: &mut MemoryFs, root: &Path, dir: &Path) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                walk(fs, root, &path)?;
            } else if path.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                let rel = rel.to_str().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("non-utf8 path: {}", rel.display()),
                    )
                })?;
                fs.insert_file(rel, std::fs::read(&path)?);
            }
        }
        Ok(())
    }

    let mut fs = MemoryFs::new();
    walk(&mut fs, dir, dir)?;
    Ok(fs)
}

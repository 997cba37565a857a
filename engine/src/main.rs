use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use vigil_core::{
    recovery_steps, resolve_state_dir, CONFIG_FILE, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT,
};
use vigil_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use vigil_server::{build_state, serve};

#[derive(Parser, Debug)]
#[command(name = "vigil-engine")]
#[command(about = "Headless health watchdog and recovery advisor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
        /// Override the scan cadence without editing the config file.
        #[arg(long)]
        scan_interval_ms: Option<u64>,
        #[arg(long, default_value_t = 14)]
        log_retention_days: u64,
    },
    /// Print the advisory recovery plan and exit.
    Steps,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            scan_interval_ms,
            log_retention_days,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, log_retention_days)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..ObservabilityEvent::new("logging.initialized", "engine.main")
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);

            let overrides = build_cli_overrides(scan_interval_ms);
            let state = build_state(&state_dir, overrides).await?;
            serve(addr, state).await?;
        }
        Command::Steps => {
            println!("{}", serde_json::to_string_pretty(&recovery_steps())?);
        }
    }

    Ok(())
}

fn build_cli_overrides(scan_interval_ms: Option<u64>) -> Option<serde_json::Value> {
    let scan_interval_ms = scan_interval_ms?;
    let mut root = serde_json::Map::new();
    root.insert(
        "scan_interval_ms".to_string(),
        serde_json::Value::from(scan_interval_ms),
    );
    Some(serde_json::Value::Object(root))
}

fn log_startup_paths(state_dir: &Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let config_path = state_dir.join(CONFIG_FILE);
    info!("starting vigil-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={} config_path={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use libtentacle::{LocalScriptService, LocalScriptServiceConfig};
use tentacle_client::{
    ScriptExecutionHooks, ScriptLog, ScriptOperationResult, ScriptRun, TentacleClient,
    TentacleClientOptions,
};
use tentacle_protocol::capabilities::{
    CAPABILITIES_SERVICE_V2, KUBERNETES_SCRIPT_SERVICE_V1, SCRIPT_SERVICE, SCRIPT_SERVICE_V2,
};
use tentacle_protocol::{
    ProcessOutputSource, ScriptIsolationLevel, ServiceEndpoint, StartScriptCommand, TentacleRpc,
    paths,
};

#[derive(Parser)]
#[command(
    name = "tentacle-local",
    about = "Run scripts through the tentacle client against an in-process agent"
)]
struct Cli {
    /// Options file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Script services the local agent advertises. Overrides the
    /// `[agent]` capabilities from the config file.
    #[arg(long, value_enum, global = true)]
    agent: Option<AgentProfile>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script to completion and exit with its exit code
    Run {
        /// Script body, passed to the agent's shell
        script: String,

        /// Positional arguments for the script
        #[arg(last = true)]
        args: Vec<String>,

        /// Hold the agent's isolation mutex while the script runs
        #[arg(long)]
        isolated: bool,

        /// Isolation mutex name; scripts sharing a name never overlap
        #[arg(long)]
        mutex: Option<String>,

        /// Where to persist the command context while the script runs
        #[arg(long)]
        state: Option<PathBuf>,

        /// Persist output as JSON lines
        #[arg(long)]
        log: Option<PathBuf>,
    },

    /// Show which script service the client would use
    Capabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AgentProfile {
    Legacy,
    V2,
    Kubernetes,
}

impl AgentProfile {
    fn capabilities(self) -> Vec<String> {
        let services: &[&str] = match self {
            Self::Legacy => &[SCRIPT_SERVICE],
            Self::V2 => &[SCRIPT_SERVICE, SCRIPT_SERVICE_V2, CAPABILITIES_SERVICE_V2],
            Self::Kubernetes => &[KUBERNETES_SCRIPT_SERVICE_V1, CAPABILITIES_SERVICE_V2],
        };
        services.iter().map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    client: TentacleClientOptions,
    #[serde(default)]
    agent: LocalScriptServiceConfig,
}

fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (paths::config_path(), false),
    };
    if !required && !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

/// Echoes script output and keeps the latest command context on disk so an
/// interrupted run can be inspected.
struct ConsoleHooks {
    state_path: PathBuf,
}

#[async_trait]
impl ScriptExecutionHooks for ConsoleHooks {
    fn on_status_received(&self, result: &ScriptOperationResult) {
        for line in &result.status.logs {
            match line.source {
                ProcessOutputSource::StdErr => eprintln!("{}", line.text),
                _ => println!("{}", line.text),
            }
        }

        let written = serde_json::to_vec_pretty(&result.context)
            .map_err(anyhow::Error::from)
            .and_then(|json| fs::write(&self.state_path, json).map_err(anyhow::Error::from));
        if let Err(err) = written {
            warn!(path = %self.state_path.display(), "failed to persist command context: {err}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tentacle_local=info,tentacle_client=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_file_config(cli.config.as_deref())?;
    if let Some(agent) = cli.agent {
        config.agent.capabilities = agent.capabilities();
    }

    let agent = LocalScriptService::new(config.agent);
    let rpc: Arc<dyn TentacleRpc> = Arc::new(agent);
    let client = TentacleClient::new(
        ServiceEndpoint::new("local://tentacle", "local"),
        rpc,
        config.client,
    );

    match cli.command {
        Commands::Run {
            script,
            args,
            isolated,
            mutex,
            state,
            log,
        } => {
            let mut command = StartScriptCommand::new(script);
            command.arguments = args;
            if isolated || mutex.is_some() {
                command.isolation = ScriptIsolationLevel::FullIsolation;
            }
            command.isolation_mutex_name = mutex;
            let code = run(&client, command, state, log).await?;
            std::process::exit(code);
        }
        Commands::Capabilities => {
            let version = client
                .negotiate_script_service(&CancellationToken::new())
                .await?;
            println!("{version}");
            if let Some(capabilities) = client.negotiator().cached(client.endpoint()) {
                for capability in capabilities.supported_capabilities {
                    println!("  {capability}");
                }
            }
            Ok(())
        }
    }
}

async fn run(
    client: &TentacleClient,
    command: StartScriptCommand,
    state: Option<PathBuf>,
    log: Option<PathBuf>,
) -> Result<i32> {
    let state_path = state.unwrap_or_else(paths::default_state_path);
    if let Some(parent) = state_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let script_log = match log {
        Some(path) => ScriptLog::open(&path)
            .with_context(|| format!("failed to open log {}", path.display()))?,
        None => ScriptLog::new(),
    };
    let run = ScriptRun::new()
        .with_log(script_log)
        .with_hooks(Arc::new(ConsoleHooks { state_path }));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling script");
                cancel.cancel();
            }
        }
    });

    info!(ticket = %command.script_ticket, "running script");
    let result = client.execute_script(command, &run, &cancel).await?;
    info!(
        ticket = %result.context.script_ticket,
        exit_code = result.exit_code,
        was_canceled = result.was_canceled,
        "script finished"
    );
    Ok(result.exit_code)
}

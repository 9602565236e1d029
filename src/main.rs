use anyhow::Context;
use clap::Parser;
use figment::providers::Serialized;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use procplug::config;
use procplug::{Client, ClientConfig, FunctionStub};

#[derive(Parser, Debug)]
#[command(name = "procplug")]
#[command(about = "Launch a plugin executable and inspect or call its functions", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Print the input and output schemas of every function
    Schemas {
        /// Plugin executable
        plugin: PathBuf,
    },
    /// Call one function with a JSON input and print its output
    Call {
        plugin: PathBuf,
        function: String,
        /// JSON input
        #[arg(default_value = "{}")]
        input: String,
    },
    /// Start the plugin, wait until it is healthy, then stop it
    Check { plugin: PathBuf },
}

impl Command {
    fn plugin(&self) -> &Path {
        match self {
            Command::Schemas { plugin } | Command::Call { plugin, .. } | Command::Check { plugin } => {
                plugin
            }
        }
    }
}

fn load_config(file: Option<&Path>, plugin: &Path) -> anyhow::Result<ClientConfig> {
    let figment = config::figment(file)?
        .merge(Serialized::default("path", plugin));
    Ok(config::extract(figment)?)
}

async fn run(client: &Client, command: &Command) -> anyhow::Result<Option<Value>> {
    client.open(CancellationToken::new()).await?;

    match command {
        Command::Schemas { .. } => {
            let schemas = client.schemas().await?;
            Ok(Some(serde_json::to_value(schemas)?))
        }
        Command::Call {
            function, input, ..
        } => {
            let input: Value = serde_json::from_str(input).context("input is not valid JSON")?;
            let connection = client
                .connection()
                .context("plugin closed before the call was made")?;
            let stub = FunctionStub::<Value, Value>::new(function.as_str(), &connection)?;
            Ok(Some(stub.call(&input).await?))
        }
        Command::Check { .. } => {
            info!(pid = client.pid(), "Plugin is healthy");
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    procplug::logging::init(args.debug, args.json_logs);

    let config = match load_config(args.config.as_deref(), args.command.plugin()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e:#}");
            return Err(e);
        }
    };

    let client = Client::new(config);
    let outcome = tokio::select! {
        outcome = run(&client, &args.command) => outcome,
        _ = signal::ctrl_c() => {
            info!("Interrupted, stopping plugin");
            Ok(None)
        }
    };

    if let Err(e) = client.close().await {
        error!("Failed to stop plugin: {e}");
    }

    if let Some(output) = outcome? {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}

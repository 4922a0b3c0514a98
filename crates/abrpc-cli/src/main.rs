//! # abrpc CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run a provider exposing the Echo service
//! abrpc serve -b 0.0.0.0:9000
//!
//! # Call it (prints raw JSON, pipe into jq etc.)
//! abrpc call 127.0.0.1:9000 Echo echo '["hello"]'
//!
//! # Call with client settings from a JSON file
//! abrpc call 127.0.0.1:9000 Echo ping --config client.json
//! ```

use std::sync::Arc;

use abrpc_cli::echo::echo_registry;
use abrpc_cli::parse_params;
use abrpc_orchestrator::{ClientConfig, Orchestrator, StaticDiscovery};
use abrpc_server::Node;
use anyhow::{Context, Result};
use argh::FromArgs;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// abrpc - asynchronous binary RPC
struct Cli {
    /// log at debug level unless RUST_LOG says otherwise
    #[argh(switch, short = 'v')]
    verbose: bool,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

// The node serves the built-in `Echo` service: `ping`, `echo` and `sleep`.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a provider node serving the Echo service
struct ServeArgs {
    /// address to bind to; port 0 picks a free port
    #[argh(option, short = 'b', default = "\"0.0.0.0:9000\".into()")]
    bind: String,
}

// One-shot call through the full client stack against a single provider address.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method and print the JSON result
struct CallArgs {
    /// provider address (host:port)
    #[argh(positional)]
    address: String,

    /// interface name
    #[argh(positional)]
    interface: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// parameters: a JSON array, or a single JSON value
    #[argh(positional)]
    params: Option<String>,

    /// client configuration file (JSON)
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// request timeout in milliseconds, overriding the configuration
    #[argh(option, short = 't')]
    timeout_ms: Option<u64>,

    /// maximum number of retries, overriding the configuration
    #[argh(option, short = 'r')]
    retries: Option<u32>,

    /// parameter type of each parameter, selecting an overload
    #[argh(option, long = "type")]
    types: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Logs go to stderr so `call` output stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let handle = Node::new(echo_registry())
        .bind(&args.bind)
        .await
        .with_context(|| format!("Failed to start node on {}", args.bind))?;

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    handle.shutdown();
    handle.join().await?;
    Ok(())
}

fn load_config(args: &CallArgs) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => {
            ClientConfig::from_json_file(path).with_context(|| format!("Failed to load config {}", path))?
        }
        None => ClientConfig::default(),
    };
    if let Some(timeout_ms) = args.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    if let Some(retries) = args.retries {
        config.retry.max_retries = retries;
    }
    Ok(config)
}

async fn run_call(args: CallArgs) -> Result<()> {
    let config = load_config(&args)?;
    let params = parse_params(args.params.as_deref())?;

    let discovery = Arc::new(StaticDiscovery::with_services(
        [args.interface.as_str()],
        vec![args.address.clone()],
    ));
    let orchestrator = Orchestrator::new(config, discovery)?;
    let proxy = orchestrator.proxy(args.interface.as_str());

    let result = if args.types.is_empty() {
        proxy.call(&args.method, params).await
    } else {
        let types: Vec<&str> = args.types.iter().map(String::as_str).collect();
        proxy.call_with_types(&args.method, &types, params).await
    };
    orchestrator.shutdown();

    let value = result.with_context(|| format!("{}.{} failed", args.interface, args.method))?;
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

#![forbid(unsafe_code)]
//! `kb` — command-line adapter for the knowledge runtime.
//!
//! Transport and rendering only: arguments map onto a [`LoadRequest`], the
//! result renders to stdout (content) and stderr (warnings). Exit code 0
//! for any served result — including degraded ones — and 2 for a rejected
//! request.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kb_runtime::{
    ConfigError, KnowledgeLoader, LoadError, LoadRequest, RuntimeConfig,
};

const CONFIG_ENV: &str = "KB_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "kb.toml";

#[derive(Debug, Parser)]
#[command(name = "kb")]
#[command(about = "Assemble task-relevant slices of a layered knowledge base")]
struct Cli {
    /// Config file; defaults to `$KB_CONFIG`, then `kb.toml` if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the content root from config.
    #[arg(long, global = true)]
    content_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Assemble knowledge for a task and/or explicit layers.
    Get(GetArgs),
    /// List indexed layers with file counts and token estimates.
    Layers,
    /// Search indexed content for a case-insensitive substring.
    Search(SearchArgs),
    /// Serve the HTTP adapter (`POST /load`).
    #[cfg(feature = "http")]
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct GetArgs {
    /// Free-form task description, matched against the trigger rules.
    task: Option<String>,
    /// Explicit layers, comma-separated; `*` selects every indexed layer.
    #[arg(long, value_delimiter = ',')]
    layers: Vec<String>,
    /// Token budget for this request.
    #[arg(long)]
    budget: Option<u64>,
    /// Overall timeout override, in milliseconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Print the full result as JSON instead of raw content.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    /// Maximum number of matches.
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[cfg(feature = "http")]
#[derive(Debug, Args)]
struct ServeArgs {
    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:7171")]
    addr: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::from(2);
        }
    };
    let loader = KnowledgeLoader::builder().config(config).build().await;

    match cli.command {
        Command::Get(args) => run_get(&loader, args).await,
        Command::Layers => run_layers(&loader),
        Command::Search(args) => run_search(&loader, args).await,
        #[cfg(feature = "http")]
        Command::Serve(args) => run_serve(loader, args).await,
    }
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig, ConfigError> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            default.exists().then_some(default)
        });
    let (mut config, warnings) = RuntimeConfig::load(path.as_deref())?;
    for warning in &warnings {
        eprintln!("config: {warning}");
    }
    if let Some(root) = &cli.content_root {
        config.content_root = root.clone();
    }
    Ok(config)
}

async fn run_get(loader: &KnowledgeLoader, args: GetArgs) -> ExitCode {
    let request = LoadRequest {
        task: args.task,
        layers: (!args.layers.is_empty()).then_some(args.layers),
        token_budget: args.budget,
        timeout_override_ms: args.timeout,
        ..LoadRequest::default()
    };
    match loader.load(request).await {
        Ok(result) => {
            for warning in &result.warnings {
                eprintln!("warning: {warning}");
            }
            if args.json {
                match serde_json::to_string_pretty(&result) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(error) => {
                        eprintln!("error: rendering result: {error}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                print!("{}", result.content);
                if !result.content.ends_with('\n') && !result.content.is_empty() {
                    println!();
                }
            }
            ExitCode::SUCCESS
        }
        Err(error @ LoadError::BadRequest { .. }) => {
            eprintln!("error: {error}");
            ExitCode::from(2)
        }
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run_layers(loader: &KnowledgeLoader) -> ExitCode {
    let snapshot = loader.index().snapshot();
    for layer in snapshot.layer_ids() {
        let files = snapshot.files(&layer);
        println!(
            "{}\t{} files\t{} bytes\t~{} tokens",
            layer,
            files.len(),
            snapshot.layer_byte_size(&layer),
            snapshot.layer_token_estimate(&layer),
        );
    }
    ExitCode::SUCCESS
}

async fn run_search(loader: &KnowledgeLoader, args: SearchArgs) -> ExitCode {
    for found in loader.search(&args.query, args.limit).await {
        println!("{}:{}: {}", found.file, found.line, found.text);
    }
    ExitCode::SUCCESS
}

#[cfg(feature = "http")]
async fn run_serve(loader: KnowledgeLoader, args: ServeArgs) -> ExitCode {
    use std::sync::Arc;

    let router = kb_runtime::http::router(Arc::new(loader));
    let listener = match tokio::net::TcpListener::bind(&args.addr).await {
        Ok(listener) => listener,
        Err(error) => {
            eprintln!("error: binding {}: {error}", args.addr);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(addr = %args.addr, "serving POST /load");
    if let Err(error) = axum::serve(listener, router).await {
        eprintln!("error: server: {error}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

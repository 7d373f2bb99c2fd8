//! exthost - extension host with an example echo extension.
//!
//! Usage:
//!   exthost run [-m MSG]...        Send messages to the echo extension
//!   exthost script FILE            Run a client script against the extension
//!   exthost list [--dir DIR]       List scripted extensions
//!   exthost --help                 Show help

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, bail};

use exthost_core::{Envelope, HostConfig};
use exthost_echo::{EchoConfig, EchoExtension};
use exthost_runtime::{ExtensionHost, ScriptBridge, ScriptedExtension};

#[derive(Parser)]
#[command(
    name = "exthost",
    version,
    about = "Extension host with an example echo extension",
    long_about = "exthost loads an extension, attaches a script context to it and \
                  exchanges async and sync messages.\n\n\
                  The built-in \"example\" extension echoes every message; pass \
                  --extension to load a scripted extension directory instead."
)]
struct Cli {
    /// Host configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send messages and print the replies
    Run {
        /// Message to send (repeatable)
        #[arg(short, long = "message", default_value = "hello")]
        messages: Vec<String>,

        /// Only send sync messages
        #[arg(long, conflicts_with = "async_only")]
        sync_only: bool,

        /// Only send async messages
        #[arg(long)]
        async_only: bool,

        /// Delay before async replies (built-in extension)
        #[arg(long, default_value = "2")]
        delay_secs: u64,

        /// Source name in replies (built-in extension)
        #[arg(long, default_value = "rust")]
        source: String,

        /// Load a scripted extension directory instead of the built-in one
        #[arg(short, long)]
        extension: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Evaluate a client script with the extension's API
    Script {
        /// Script file
        file: PathBuf,

        /// Load a scripted extension directory instead of the built-in one
        #[arg(short, long)]
        extension: Option<PathBuf>,

        /// How long to wait for posted replies
        #[arg(short, long, default_value = "3")]
        wait_secs: u64,
    },

    /// List scripted extensions
    List {
        /// Directory to search (defaults to the configured extension directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = match &cli.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => HostConfig::default(),
    };

    match cli.command {
        Command::Run {
            messages,
            sync_only,
            async_only,
            delay_secs,
            source,
            extension,
            format,
        } => {
            let echo = EchoConfig::default()
                .with_source(source)
                .with_delay(Duration::from_secs(delay_secs));
            let host = load_host(config, extension.as_deref(), echo)?;
            run_messages(host, &messages, !async_only, !sync_only, delay_secs, format).await?;
        }
        Command::Script {
            file,
            extension,
            wait_secs,
        } => {
            let host = load_host(config, extension.as_deref(), EchoConfig::default())?;
            run_script(host, &file, Duration::from_secs(wait_secs)).await?;
        }
        Command::List { dir } => {
            let dir = dir.unwrap_or_else(|| config.extension_dir.clone());
            run_list(&dir, &config)?;
        }
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("exthost={log_level},script={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load either the built-in echo extension or a scripted one.
fn load_host(config: HostConfig, extension: Option<&Path>, echo: EchoConfig) -> Result<ExtensionHost> {
    let host = match extension {
        Some(dir) => {
            let scripted = ScriptedExtension::load(dir, &config.script)
                .with_context(|| format!("Failed to load extension {}", dir.display()))?;
            ExtensionHost::load(scripted, config)?
        }
        None => ExtensionHost::load(EchoExtension::with_config(echo), config)?,
    };
    Ok(host)
}

/// Send every message and print the replies.
async fn run_messages(
    host: ExtensionHost,
    messages: &[String],
    send_sync: bool,
    send_async: bool,
    delay_secs: u64,
    format: OutputFormat,
) -> Result<()> {
    let mut instance = host.create_instance()?;
    eprintln!("Attached instance {} to \"{}\"", instance.id(), host.name());

    let mut expected = 0;
    for message in messages {
        if send_sync {
            let reply = instance.send_sync_message(message)?;
            print_envelope(&Envelope::sync(instance.id(), reply), format)?;
        }
        if send_async {
            instance.post_message(message)?;
            expected += 1;
        }
    }

    // Scripted extensions pick their own delay; allow some slack.
    let wait = Duration::from_secs(delay_secs + 5);
    let mut received = 0;
    while received < expected {
        match tokio::time::timeout(wait, instance.recv()).await {
            Ok(Some(envelope)) => {
                print_envelope(&envelope, format)?;
                received += 1;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(target: "exthost", received, expected, "timed out waiting for replies");
                break;
            }
        }
    }

    instance.close()?;
    host.shutdown().await;

    if received < expected {
        bail!("Received {received} of {expected} replies");
    }
    Ok(())
}

fn print_envelope(envelope: &Envelope, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("[{}] {}", envelope.kind, envelope.payload),
        OutputFormat::Json => println!("{}", serde_json::to_string(envelope)?),
    }
    Ok(())
}

/// Evaluate a client script, then print replies until `wait` passes.
async fn run_script(host: ExtensionHost, file: &Path, wait: Duration) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let mut bridge = ScriptBridge::attach(&host)?;
    let result = bridge.eval(&source)?;
    if !result.is_unit() {
        println!("{result}");
    }

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, bridge.next_reply()).await {
            Ok(Ok(Some(delivery))) => {
                println!("[{}] {}", delivery.envelope.kind, delivery.envelope.payload);
                if let Some(value) = delivery.result.filter(|v| !v.is_unit()) {
                    println!("  -> {value}");
                }
            }
            Ok(Ok(None)) | Err(_) => break,
            Ok(Err(err)) => return Err(err.into()),
        }
    }

    bridge.close()?;
    host.shutdown().await;
    Ok(())
}

/// Print the scripted extensions found in `dir`.
fn run_list(dir: &Path, config: &HostConfig) -> Result<()> {
    println!("example (built-in)");

    let extensions = exthost_runtime::discover(dir, config)
        .with_context(|| format!("Failed to discover extensions in {}", dir.display()))?;

    if extensions.is_empty() {
        eprintln!("No scripted extensions in {}", dir.display());
        return Ok(());
    }

    for extension in &extensions {
        let manifest = extension.manifest();
        println!(
            "{} {} - {}",
            extension.name(),
            manifest.version,
            if manifest.description.is_empty() {
                "(no description)"
            } else {
                manifest.description.as_str()
            }
        );
    }

    Ok(())
}

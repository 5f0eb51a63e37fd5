use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use chorus::config::ChorusConfig;
use chorus::engine::Sidecar;
use chorus::error::{ChorusError, Result};
use chorus::filter;
use chorus::host::memory::MemoryHub;
use chorus::protocol::MicroProposal;

#[derive(Parser)]
#[command(name = "chorus", about = "Per-agent coordination sidecar for multi-agent chat")]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration directory, then print the result.
    CheckConfig {
        /// Directory containing config.toml.
        #[arg(long, default_value = ".")]
        config: PathBuf,
    },
    /// Run the pure proposal filter over two proposals (JSON).
    Filter {
        #[arg(long)]
        mine: String,
        #[arg(long)]
        theirs: String,
        #[arg(long)]
        my_name: String,
        #[arg(long)]
        peer_name: String,
    },
    /// Drive two in-process engines through one negotiation round against
    /// the in-memory host and print the transcript.
    Simulate {
        #[arg(long, default_value = "how should we cache session data?")]
        trigger: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("chorus=debug")
    } else {
        EnvFilter::new("chorus=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::CheckConfig { config } => cmd_check_config(&config).await,
        Commands::Filter {
            mine,
            theirs,
            my_name,
            peer_name,
        } => cmd_filter(&mine, &theirs, &my_name, &peer_name),
        Commands::Simulate { trigger } => cmd_simulate(&trigger).await,
    }
}

async fn cmd_check_config(dir: &PathBuf) -> Result<()> {
    let config = ChorusConfig::load(dir).await?;
    let rendered =
        toml::to_string_pretty(&config).map_err(|e| ChorusError::Config(e.to_string()))?;
    println!("{}", rendered);
    Ok(())
}

fn cmd_filter(mine: &str, theirs: &str, my_name: &str, peer_name: &str) -> Result<()> {
    let mine: MicroProposal = serde_json::from_str(mine)?;
    let theirs: MicroProposal = serde_json::from_str(theirs)?;
    let result = filter::resolve(
        &mine,
        &theirs,
        my_name,
        peer_name,
        &ChorusConfig::default().filter,
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn cmd_simulate(trigger: &str) -> Result<()> {
    let hub = MemoryHub::new();

    hub.script_gateway(
        "alpha",
        Some(
            r#"{"angle": "cache sizing and eviction", "confidence": 0.82,
                "covers": ["eviction", "memory"], "solo_sufficient": true}"#,
        ),
    );
    hub.script_gateway(
        "beta",
        Some(
            r#"{"angle": "invalidation and consistency", "confidence": 0.74,
                "covers": ["staleness", "writes"], "solo_sufficient": true}"#,
        ),
    );

    let alpha = Sidecar::start(simulate_config("alpha"), hub.ports_for("alpha"))?;
    let beta = Sidecar::start(simulate_config("beta"), hub.ports_for("beta"))?;

    // Let both fast paths connect before the trigger lands.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let message_id = hub.user_message("c-demo", "user", trigger);
    println!("trigger {}: {}", message_id, trigger);

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    println!("\ncoordination stream:");
    for (speaker, content) in hub.coord_posts() {
        println!("  [{}] {}", speaker, content);
    }
    println!("\nreplies:");
    for reply in hub.replies() {
        println!("  [{} in {}] {}", reply.agent, reply.chat_id, reply.text);
    }

    let stats = alpha.engine().stats();
    println!(
        "\nalpha: {} round(s), {} solo / {} parallel / {} synthesis, {} fail-open",
        stats.rounds_started,
        stats.resolved_solo,
        stats.resolved_parallel,
        stats.resolved_synthesis,
        stats.fail_opens
    );

    alpha.stop().await;
    beta.stop().await;
    Ok(())
}

fn simulate_config(name: &str) -> ChorusConfig {
    let mut config = ChorusConfig::default();
    config.agent.name = name.to_string();
    config.coordination.max_round_ms = 3_000;
    config.coordination.cleanup_ms = 6_000;
    config.inbound.poll_interval_ms = 1_000;
    config.dispatch.backstop_ms = 4_000;
    config
}

//! pixcast-server: entry point.
//!
//! ```text
//! pixcast-server                  Run the demo session
//! pixcast-server --config <path>  Load a custom config TOML
//! pixcast-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pixcast_server::config::ServerConfig;
use pixcast_server::service::DemoSession;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "pixcast-server", about = "pixcast adaptive window encoding host")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "pixcast-server.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Write the default configuration to the `--config` path and exit.
    #[arg(long)]
    init_config: bool,

    /// Override `demo.duration_secs` (0 = until Ctrl-C).
    #[arg(short, long)]
    duration: Option<u64>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    if cli.init_config {
        ServerConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    // Config first, so its log level can seed the filter.
    let mut config = ServerConfig::load(&cli.config);
    if let Some(secs) = cli.duration {
        config.demo.duration_secs = secs;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("pixcast-server v{}", env!("CARGO_PKG_VERSION"));
    info!("encodings: {}", config.session.encodings.join(", "));
    info!("batch delay: {} ms", config.engine.batch.start_delay_ms);
    info!("client latency: {} ms", config.session.latency_ms);

    let json_stats = config.logging.json_stats;
    let session = DemoSession::new(config)?;
    let stop = session.stop_handle();

    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop_clone.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    let stats = session.run().await?;
    if json_stats {
        println!("{}", stats.to_json()?);
    }

    Ok(())
}

//! 🚀 esio-cli: the front door, the bouncer, the maitre d' of esio.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary is the thin wrapper that parses args, sets up logging, loads config
//! and then lets the library do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 📡 Scroll an index out of one Elasticsearch cluster and bulk it into another.
#[derive(Debug, Parser)]
#[command(name = "esio", version, about)]
struct Args {
    /// 📋 Path to the TOML config. `ESIO_*` env vars fill in whatever it leaves out.
    #[arg(default_value = "esio.toml")]
    config: PathBuf,

    /// 🔇 Hide the progress bar and the final table.
    #[arg(long)]
    quiet: bool,
}

/// 🕵️ Does this error chain smell like "nobody is listening on that port"?
fn looks_like_connection_trouble(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let cause = cause.to_string();
        cause.contains("error sending request")
            || cause.contains("connection refused")
            || cause.contains("Connection refused")
            || cause.contains("tcp connect error")
            || cause.contains("dns error")
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // 📡 println! debugging is a lifestyle choice we're trying to move past
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // 🔒 check the file exists before we get too emotionally attached
    let found = args.config.try_exists().with_context(|| {
        format!(
            "💀 couldn't check whether the config file exists. If it's a relative path, \
            try an absolute one. Was checking here: '{}'",
            args.config.display()
        )
    })?;
    let config_path = if found {
        Some(args.config.as_path())
    } else {
        info!(
            "📋 no config file at '{}', going with env vars alone",
            args.config.display()
        );
        None
    };

    let mut app_config = esio::app_config::load_config(config_path)
        .context("💀 couldn't load the config. Take a look at the file, something obvious is usually hiding in plain sight")?;
    if args.quiet {
        app_config.runtime.show_progress = false;
    }

    // 🚀 SEND IT. No take-backs.
    match esio::run(app_config).await {
        Ok(summary) => {
            info!(
                "🍾 {} doc(s) read, {} doc(s) written",
                summary.docs_read, summary.docs_written
            );
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one layer at a time
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
            }
            if looks_like_connection_trouble(&err) {
                error!(
                    "🔧 hint: looks like a cluster isn't reachable. Double-check that both \
                    Elasticsearch clusters are actually running and that the addresses in the \
                    config are right. If you're using Docker, `docker ps` is your friend. ☕"
                );
            }
            // 🗑️ exit with prejudice
            std::process::exit(1);
        }
    }
}

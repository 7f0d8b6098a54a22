//! `retrogate` CLI - run the gateway or transcode a page offline

mod cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use retrogate::{CliOverrides, OutputFormat};

#[derive(Parser)]
#[command(name = "retrogate")]
#[command(about = "Retro-web gateway: modern pages for vintage browsers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// User-Agent sent upstream instead of the client's
        #[arg(long)]
        user_agent: Option<String>,

        /// How non-ASCII text is written
        #[arg(long, value_enum)]
        output: Option<OutputFormat>,

        /// Configuration file (defaults to the user config directory)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Preset to apply, e.g. macweb2
        #[arg(long)]
        preset: Option<String>,

        /// Log routing decisions
        #[arg(short, long)]
        verbose: bool,
    },

    /// Transcode an HTML file (or stdin) and print the result
    Transcode {
        /// Input file, `-` for stdin
        #[arg(default_value = "-")]
        file: String,

        /// URL the page came from (for the domain whitelist)
        #[arg(long)]
        url: Option<String>,

        /// Configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Preset to apply
        #[arg(long)]
        preset: Option<String>,

        /// How non-ASCII text is written
        #[arg(long, value_enum)]
        output: Option<OutputFormat>,
    },

    /// List built-in presets
    Presets,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "retrogate=debug,tower_http=debug" } else { "retrogate=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            user_agent,
            output,
            config,
            preset,
            verbose,
        } => {
            init_tracing(verbose);
            let overrides = CliOverrides {
                host,
                port,
                user_agent,
                output,
                preset,
            };
            cmd::serve::cmd_serve(config.as_deref(), overrides).await?;
        }
        Commands::Transcode {
            file,
            url,
            config,
            preset,
            output,
        } => {
            init_tracing(false);
            let overrides = CliOverrides {
                output,
                preset,
                ..CliOverrides::default()
            };
            cmd::transcode::cmd_transcode(&file, url.as_deref(), config.as_deref(), overrides)?;
        }
        Commands::Presets => {
            cmd::presets::cmd_presets()?;
        }
    }

    Ok(())
}

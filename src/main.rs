//! scriptlink - device bridge for script-execution devices
//!
//! This is the binary entry point. All logic lives in the library.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};

use scriptlink_app::config::{default_config_path, init_config_file, load_settings};

/// scriptlink - serve script-execution devices over WebSocket and ADB
#[derive(Parser, Debug)]
#[command(name = "scriptlink")]
#[command(about = "Device bridge for remote script-execution devices", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept devices and read commands from stdin (default)
    Serve(ServeArgs),

    /// Write a default config file
    InitConfig {
        /// Config file to create
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Listening port, overrides `[server] port`
    #[arg(long)]
    port: Option<u16>,

    /// Listening address, overrides `[server] bind`
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Serve direct connections only
    #[arg(long)]
    no_adb: bool,

    /// Config file to load
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    explicit
        .or_else(default_config_path)
        .ok_or_else(|| eyre!("No config directory available; pass --config"))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    match args.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::InitConfig { config } => {
            let path = config_path(config)?;
            if init_config_file(&path)? {
                eprintln!("Wrote {}", path.display());
            } else {
                eprintln!("{} already exists", path.display());
            }
            Ok(())
        }
        Command::Serve(serve) => {
            scriptlink_core::logging::init()?;

            let mut settings = match config_path(serve.config) {
                Ok(path) => load_settings(&path),
                Err(_) => Default::default(),
            };
            if let Some(port) = serve.port {
                settings.server.port = port;
            }
            if let Some(bind) = serve.bind {
                settings.server.bind = bind;
            }

            scriptlink::run_headless(settings, !serve.no_adb).await?;
            Ok(())
        }
    }
}

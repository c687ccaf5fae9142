//! Binary entrypoint for the smsgate CLI.
//!
//! Commands:
//! - `start` - run the gateway with every configured modem
//! - `check-modem --port <path> [-b <baud>]` - verify a modem answers on a port
//! - `init` - write a default configuration file
//!
//! See the library crate docs for module-level details: `smsgate::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use smsgate::config::Config;
use smsgate::gateway::Gateway;
use smsgate::logutil::escape_at;
use smsgate::modem::ModemDriver;

#[derive(Parser)]
#[command(name = "smsgate")]
#[command(about = "An SMS gateway for serial GSM modems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start,
    /// Check that a GSM modem answers on a serial port
    CheckModem {
        /// Modem serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 115200)]
        baud: u32,
    },
    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config early so logging can pick up the configured level and file.
    let pre_config = Config::load(&cli.config).await.ok();
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start => {
            let config = match pre_config {
                Some(config) => config,
                None => Config::load(&cli.config).await?,
            };
            config.validate()?;
            info!("Starting smsgate v{}", env!("CARGO_PKG_VERSION"));

            let _gateway = Gateway::start(&config).await?;
            info!(
                "gateway running with {} device(s), queue capacity {}",
                config.devices.len(),
                config.gateway.buffer_max_size
            );

            // Workers run for process lifetime; there is no graceful drain.
            tokio::signal::ctrl_c().await?;
            info!("interrupted; exiting");
        }
        Commands::CheckModem { port, baud } => {
            let mut driver = ModemDriver::new(&port, baud, "check");
            let status = match driver.connect().await {
                Ok(()) => match driver.send_command("AT\r\n", true).await {
                    Ok(response) if response.contains("OK") => ("ok", escape_at(&response)),
                    Ok(response) => ("unexpected", escape_at(&response)),
                    Err(e) => ("no-response", e.to_string()),
                },
                Err(e) => ("open-failed", e.to_string()),
            };
            let payload = serde_json::json!({
                "status": status.0,
                "port": port,
                "baud": baud,
                "detail": status.1,
            });
            println!("{}", payload);
            std::process::exit(if status.0 == "ok" { 0 } else { 1 });
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Wrote default configuration to {}", cli.config);
            println!("Edit the [[devices]] entries, then run: smsgate start");
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;

    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    if let Some(file) = log_file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());

                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }

                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            builder.format(default_log_format);
        }
    } else {
        builder.format(default_log_format);
    }
    let _ = builder.try_init();
}

fn default_log_format(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    use std::io::Write;
    writeln!(
        fmt,
        "{} [{}] {}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        record.level(),
        record.args()
    )
}

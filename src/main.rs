//! SYSVAD - virtual audio device simulator
//!
//! Runs one render/loopback session against the simulated speaker endpoint
//! and prints its summary as JSON.

use anyhow::{anyhow, bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysvad::session::{Session, SessionConfig};
use sysvad::DriverConfig;
use tracing::{error, info};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sysvad=info".parse().unwrap())
                .add_directive("sysvad_core=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(Command::Run(options)) => options,
        Ok(Command::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("sysvad {} (built {})", sysvad::VERSION, sysvad::BUILD_DATE);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("Run 'sysvad --help' for usage");
            std::process::exit(2);
        }
    };
    let CliOptions {
        session: mut config,
        config_path,
        save_config,
        no_data_files,
    } = options;

    let config_path = config_path.or_else(default_config_path);
    if let Some(path) = &config_path {
        config.driver = DriverConfig::load(path);
    }
    if no_data_files {
        config.driver.do_not_create_data_files = true;
    }
    if save_config {
        match &config_path {
            Some(path) => {
                config.driver.save(path)?;
                info!(path = %path.display(), "Saved driver config");
            }
            None => eprintln!("Error: no config directory available"),
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let stop = Arc::new(AtomicBool::new(false));
    {
        let running = Arc::clone(&running);
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
            stop.store(true, Ordering::SeqCst);
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    info!(
        sample_rate = config.sample_rate,
        channels = config.channels,
        buffer_ms = config.buffer_ms,
        notifications = config.notifications,
        "Starting session"
    );

    let session = Session::new(config)?;
    match session.run(stop) {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !running.load(Ordering::SeqCst) {
                info!("Session interrupted");
            }
            Ok(())
        }
        Err(e) => {
            error!("Session failed: {:#}", e);
            Err(e)
        }
    }
}

/// What the command line asks for
#[derive(Debug)]
enum Command {
    Run(CliOptions),
    Help,
    Version,
}

#[derive(Debug, Default)]
struct CliOptions {
    session: SessionConfig,
    config_path: Option<PathBuf>,
    save_config: bool,
    no_data_files: bool,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut options = CliOptions::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--version" | "-v" => return Ok(Command::Version),
            "--help" | "-h" => return Ok(Command::Help),
            "--eos" | "-e" => options.session.end_of_stream = true,
            "--no-data-files" => options.no_data_files = true,
            "--save-config" => options.save_config = true,
            "--config" | "-c" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow!("--config requires a path"))?;
                options.config_path = Some(PathBuf::from(value));
                i += 2;
                continue;
            }
            "--duration-ms" | "-d" => {
                let ms: u64 = parse_value(args, i, "--duration-ms")?;
                options.session.duration = Duration::from_millis(ms);
                i += 2;
                continue;
            }
            "--rate" | "--sample-rate" | "-r" => {
                options.session.sample_rate = parse_value(args, i, "--rate")?;
                i += 2;
                continue;
            }
            "--channels" => {
                options.session.channels = parse_value(args, i, "--channels")?;
                i += 2;
                continue;
            }
            "--buffer-ms" | "-b" => {
                options.session.buffer_ms = parse_value(args, i, "--buffer-ms")?;
                i += 2;
                continue;
            }
            "--notifications" | "-n" => {
                options.session.notifications = parse_value(args, i, "--notifications")?;
                i += 2;
                continue;
            }
            arg => bail!("Unknown argument: {}", arg),
        }
        i += 1;
    }

    Ok(Command::Run(options))
}

/// Parse the value following `args[i]`
fn parse_value<T>(args: &[String], i: usize, flag: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = args
        .get(i + 1)
        .ok_or_else(|| anyhow!("{} requires a value", flag))?;
    raw.parse()
        .with_context(|| format!("Invalid value for {}: {}", flag, raw))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sysvad").join("config.json"))
}

fn print_help() {
    println!("Usage: sysvad [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -d, --duration-ms MS     Session length (default: 1000)");
    println!("  -r, --rate RATE          Sample rate (default: 48000)");
    println!("      --channels N         Channel count (default: 2)");
    println!("  -b, --buffer-ms MS       Render buffer length (default: 20)");
    println!("  -n, --notifications N    Notifications per buffer (default: 4)");
    println!("  -e, --eos                Finish with an end-of-stream packet");
    println!("  -c, --config PATH        Driver config file");
    println!("      --save-config        Write the effective driver config back");
    println!("      --no-data-files      Do not write rendered audio to disk");
    println!("  -v, --version            Show version");
    println!("  -h, --help               Show this help");
    println!();
    println!("Examples:");
    println!("  sysvad -d 2000 -n 2 --eos");
    println!("  sysvad --config ./driver.json --no-data-files");
}

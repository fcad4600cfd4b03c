//! Add-on Host - Main entry point.
//!
//! Starts every enabled out-of-process add-on, optionally sends one
//! request, prints the status of each add-on as JSON and shuts down.
//!
//! Usage: addon-host [OPTIONS] [ADDONS_DIR]
//!
//! Options:
//!   --version, -v                  Show version
//!   --help, -h                     Show this help
//!   --config PATH                  Use a config file other than ~/.addon-host/config.toml
//!   --invoke ID METHOD [PARAMS]    Send one request (PARAMS is a JSON object or array, default {})
//!
//! ADDONS_DIR overrides the configured add-ons directory.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use serde_json::Value;

use addon_host::{AddonHost, DirectoryCatalog, HostConfig, logging};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "Usage: addon-host [--config PATH] [--invoke ID METHOD [PARAMS]] [ADDONS_DIR]";

/// A single request given on the command line.
#[derive(Debug, PartialEq)]
struct InvokeArgs {
    addon_id: String,
    method: String,
    params: Value,
}

/// Parsed command line.
#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config_path: Option<PathBuf>,
    addons_dir: Option<PathBuf>,
    invoke: Option<InvokeArgs>,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    let mut iter = args.iter().skip(1).peekable();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().ok_or("--config needs a path")?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            "--invoke" => {
                let addon_id = iter.next().ok_or("--invoke needs an add-on id")?.clone();
                let method = iter.next().ok_or("--invoke needs a method")?.clone();
                // PARAMS is optional; only a JSON object or array is taken.
                let params = match iter.next_if(|a| looks_like_json(a)) {
                    Some(raw) => serde_json::from_str(raw)
                        .map_err(|e| format!("invalid PARAMS json: {}", e))?,
                    None => Value::Object(serde_json::Map::new()),
                };
                parsed.invoke = Some(InvokeArgs {
                    addon_id,
                    method,
                    params,
                });
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option: {}", other));
            }
            dir => parsed.addons_dir = Some(PathBuf::from(dir)),
        }
    }

    Ok(parsed)
}

fn looks_like_json(arg: &str) -> bool {
    let arg = arg.trim_start();
    arg.starts_with('{') || arg.starts_with('[')
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("addon-host v{}", VERSION);
        return ExitCode::SUCCESS;
    }
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{}\n{}", e, USAGE);
            return ExitCode::from(2);
        }
    };

    let config_path = cli
        .config_path
        .clone()
        .unwrap_or_else(HostConfig::default_config_path);
    let mut config = match HostConfig::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = cli.addons_dir {
        config.addons_dir = Some(dir);
    }

    // Keep the guard alive until exit so buffered log lines are flushed.
    let _log_guard = match logging::init(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging disabled: {}", e);
            None
        }
    };

    let catalog = DirectoryCatalog::new(config.addons_dir());
    let host = AddonHost::new(config);

    let failures = host.start_all_enabled(&catalog).await;
    for (addon_id, error) in &failures {
        eprintln!("{}: {}", addon_id, error);
    }

    let mut status = ExitCode::SUCCESS;
    if let Some(invoke) = cli.invoke {
        match host
            .try_invoke(&invoke.addon_id, &invoke.method, invoke.params)
            .await
        {
            Ok(result) => println!("{}", result),
            Err(e) => {
                eprintln!("{}: {}", invoke.addon_id, e);
                status = ExitCode::FAILURE;
            }
        }
    }

    match host.snapshots().await {
        Ok(snapshots) => match serde_json::to_string_pretty(&snapshots) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to encode status: {}", e),
        },
        Err(e) => eprintln!("{}", e),
    }

    host.dispose().await;
    status
}

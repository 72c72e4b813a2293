//! trellis controller entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Build the controller around the in-process mastership registry
//!   6. Spawn Ctrl-C → shutdown signal watcher
//!   7. Start the event loop, then serve switch connections until shutdown
//!   8. Cancel token + join background tasks

use tokio_util::sync::CancellationToken;
use tracing::info;

use trellis::bootstrap::logger;
use trellis::error::AppError;
use trellis::mastership::LocalRegistry;
use trellis::{Controller, ControllerSettings, config, transport};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();
    let mut config = config::load(args.config_path.as_deref())?;
    if let Some(listen) = args.listen {
        config.openflow.listen = listen;
    }

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    logger::init(
        effective_log_level,
        args.log_level.is_some(),
        config.log_file.as_deref(),
    )?;

    info!(
        controller_id = %config.controller_id,
        listen = %config.openflow.listen,
        role_support = config.mastership.role_support,
        local_role = %config.mastership.local_role,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    let shutdown = CancellationToken::new();

    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    let registry = LocalRegistry::new(true);
    let controller = Controller::new(ControllerSettings::from_config(&config), registry);
    let tasks = controller.start(shutdown.clone());

    let listener = transport::bind(&config.openflow.listen).await?;
    transport::serve(listener, controller, config.openflow.clone(), shutdown.clone()).await;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("controller stopped");
    Ok(())
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
    listen: Option<String>,
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;
    let mut listen = None;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }
        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: trellis [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Configuration file (default: config/default.toml)");
                println!("  -l, --listen <ADDR>        Switch listener address (overrides config)");
                println!("  -v, -vv, -vvv, -vvvv       Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => match iter.next() {
                Some(path) => config_path = Some(path),
                None => {
                    eprintln!("error: -f/--config requires a path argument");
                    std::process::exit(1);
                }
            },
            "-l" | "--listen" => match iter.next() {
                Some(addr) => listen = Some(addr),
                None => {
                    eprintln!("error: -l/--listen requires an address argument");
                    std::process::exit(1);
                }
            },
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add((a.len() - 1) as u8);
            }
            other => eprintln!("warning: ignoring unknown argument '{other}'"),
        }
    }

    //   -v → warn, -vv → info, -vvv → debug, -vvvv+ → trace
    let log_level = match verbosity {
        0 => None,
        1 => Some("warn"),
        2 => Some("info"),
        3 => Some("debug"),
        _ => Some("trace"),
    };

    CliArgs {
        log_level,
        config_path,
        listen,
    }
}

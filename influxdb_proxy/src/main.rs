//! Entrypoint of the influxdb_proxy binary
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

use dotenvy::dotenv;
use proxy_clap_blocks::tokio::TokioIoConfig;
use proxy_trogging::LogFilterHandle;

mod commands {
    pub(crate) mod common;
    pub(crate) mod rebalance;
    pub(crate) mod serve;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "influxdb_proxy",
    version,
    disable_help_flag = true,
    arg(
        clap::Arg::new("help")
            .short('h')
            .long("help")
            .help("Print help information")
            .action(clap::ArgAction::Help)
            .global(true)
    ),
    about = "Routing and clustering proxy for InfluxDB 1.x",
    long_about = r#"Routing and clustering proxy for InfluxDB 1.x

Examples:
    # Run the proxy against a local Consul agent
    influxdb_proxy serve --consul-address http://127.0.0.1:8500 --consul-prefix influxdb_proxy

    # Run the proxy with its configuration held in memory
    influxdb_proxy serve --config-store memory

    # Run the proxy with debug logging specified with LOG_FILTER
    LOG_FILTER=debug influxdb_proxy serve

    # Move tag shards onto their hashed hosts
    influxdb_proxy rebalance --consul-prefix influxdb_proxy
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioIoConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
#[allow(clippy::large_enum_variant)]
enum Command {
    /// Run the proxy
    Serve(commands::serve::Config),

    /// Mark tag shards whose hashed placement changed for migration
    Rebalance(commands::rebalance::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;

    tokio_runtime.block_on(async move {
        fn handle_init_logs(r: Result<LogFilterHandle, proxy_trogging::Error>) -> LogFilterHandle {
            match r {
                Ok(handle) => handle,
                Err(e) => {
                    eprintln!("Initializing logs failed: {e}");
                    std::process::exit(ReturnCode::Failure as _);
                }
            }
        }

        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Serve(config)) => {
                let log_filter =
                    handle_init_logs(config.logging_config.install_global_subscriber());
                if let Err(e) = commands::serve::command(config, log_filter, reload_serve_config).await
                {
                    eprintln!("Serve command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Rebalance(config)) => {
                handle_init_logs(config.logging_config.install_global_subscriber());
                if let Err(e) = commands::rebalance::command(config).await {
                    eprintln!("Rebalance command failed: {e}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Ignore this - a missing env file is not an error, defaults will
            // be applied when initialising the Config struct.
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(1);
        }
    };
}

/// Parse the `serve` configuration again for a reload
///
/// Values in the .env file replace those loaded at startup, so edits to it take effect.
fn reload_serve_config() -> Result<commands::serve::Config, String> {
    match dotenvy::dotenv_override() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(format!("loading .env failed: {e}")),
    }
    let config = <Config as clap::Parser>::try_parse().map_err(|e| e.to_string())?;
    match config.command {
        Some(Command::Serve(config)) => Ok(config),
        _ => Err("the proxy is not running the serve command".to_string()),
    }
}

//! Main entry point for the GPU gateway service.
//!
//! Responsibilities:
//! - Handle basic CLI flags (`--help`, `--version`) and the `generate-key`
//!   admin command.
//! - Initialize logging and tracing.
//! - Load application configuration.
//! - Discover the GPU fleet and start the scheduler's background loops.
//! - Start the Axum web server and expose HTTP routes.

use std::{env, net::SocketAddr, process, sync::Arc};

use rand::{distributions::Alphanumeric, Rng};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gpu_gateway::{
    auth::ApiKeyStore,
    cloud::CloudClient,
    config::AppConfig,
    lifecycle::LifecycleController,
    ollama::OllamaClient,
    proxy::RequestRouter,
    registry::WorkerRegistry,
    routes::{self, AppState},
};

enum CliCommand {
    Run,
    Help,
    Version,
    GenerateKey(GenerateKeyOptions),
}

#[derive(Debug, Clone)]
struct GenerateKeyOptions {
    name: String,
    email: String,
}

#[tokio::main]
async fn main() {
    let command = match parse_cli_command() {
        Ok(cmd) => cmd,
        Err(err) => {
            eprintln!("gpu-gateway: {err}");
            print_help();
            return;
        }
    };

    match command {
        CliCommand::Help => {
            print_help();
            return;
        }
        CliCommand::Version => {
            print_version();
            return;
        }
        CliCommand::GenerateKey(options) => {
            if let Err(err) = handle_generate_key(options) {
                eprintln!("gpu-gateway: {err}");
                process::exit(1);
            }
            return;
        }
        CliCommand::Run => {}
    }

    // Initialize tracing based on RUST_LOG or the fallback filter.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gpu_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting GPU gateway server...");

    let config = match AppConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("gpu-gateway: configuration error: {err}");
            process::exit(1);
        }
    };

    let cloud = Arc::new(CloudClient::new(config.cloud_api.clone()));
    let inference = Arc::new(OllamaClient::new());
    let auth_store = Arc::new(ApiKeyStore::new(config.paths.api_keys_file.clone()));

    let registry = WorkerRegistry::new();
    match registry.discover_and_seed(cloud.as_ref()).await {
        Ok(count) => info!(gpus = count, "GPU fleet discovered"),
        Err(err) => {
            error!(error = %err, "Failed to discover GPU fleet");
            eprintln!("gpu-gateway: fleet discovery failed: {err}");
            process::exit(1);
        }
    }

    let lifecycle = Arc::new(LifecycleController::new(
        registry.clone(),
        cloud,
        inference.clone(),
        config.timing.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background_loops = Arc::clone(&lifecycle).spawn_background_loops(shutdown_rx);

    let request_router = Arc::new(RequestRouter::new(
        registry.clone(),
        Arc::clone(&lifecycle),
        inference,
        config.timing.clone(),
    ));

    // Build the HTTP router.
    let state = AppState::new(registry, lifecycle, request_router, auth_store);
    let app = routes::api_router(state);

    let addr_str = format!("{}:{}", config.server.host, config.server.port);
    let addr: SocketAddr = match addr_str.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, "Invalid server address");
            eprintln!("gpu-gateway: invalid server address {addr_str} ({err})");
            process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, "Failed to bind TCP listener");
            eprintln!("gpu-gateway: cannot bind to {addr} ({err})");
            process::exit(1);
        }
    };

    info!("Server listening on {addr}");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop the scheduler loops; each exits within one tick.
    info!("Shutting down background loops...");
    let _ = shutdown_tx.send(true);
    for handle in background_loops {
        let _ = handle.await;
    }

    if let Err(err) = serve_result {
        error!(error = %err, "Server crashed");
        process::exit(1);
    }

    info!("Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to install ctrl-c handler");
    }
}

fn parse_cli_command() -> Result<CliCommand, String> {
    let mut args: Vec<String> = env::args().collect();
    if args.is_empty() {
        return Ok(CliCommand::Run);
    }

    let _program = args.remove(0);
    if args.is_empty() {
        return Ok(CliCommand::Run);
    }

    let mut iter = args.into_iter();
    let first = iter.next().unwrap();
    match first.as_str() {
        "-h" | "--help" | "help" => Ok(CliCommand::Help),
        "-V" | "--version" | "version" => Ok(CliCommand::Version),
        "run" | "server" => Ok(CliCommand::Run),
        "generate-key" => {
            let remaining: Vec<String> = iter.collect();
            let options = parse_generate_key_options(&remaining)?;
            Ok(CliCommand::GenerateKey(options))
        }
        other if other.starts_with('-') => Err(format!("Unknown option '{other}'")),
        other => Err(format!("Unknown command '{other}'")),
    }
}

fn parse_generate_key_options(args: &[String]) -> Result<GenerateKeyOptions, String> {
    let mut name = None;
    let mut email = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--name" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "--name requires a value".to_string())?;
                name = Some(value.clone());
            }
            "--email" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "--email requires a value".to_string())?;
                email = Some(value.clone());
            }
            other => return Err(format!("Unknown generate-key option '{other}'")),
        }
    }

    Ok(GenerateKeyOptions {
        name: name.ok_or_else(|| "generate-key requires --name".to_string())?,
        email: email.ok_or_else(|| "generate-key requires --email".to_string())?,
    })
}

fn handle_generate_key(options: GenerateKeyOptions) -> Result<(), String> {
    let config = AppConfig::load().map_err(|err| format!("configuration error: {err}"))?;
    let store = ApiKeyStore::new(config.paths.api_keys_file.clone());

    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(43)
        .map(char::from)
        .collect();
    let api_key = format!("sk-{token}");

    let added = store
        .add_user(&api_key, &options.name, &options.email)
        .map_err(|err| err.to_string())?;

    if !added {
        return Err("failed to add user (key already exists, try again)".to_string());
    }

    println!(
        "\nAPI key generated successfully for {} ({}):",
        options.name, options.email
    );
    println!("\n{api_key}\n");
    println!(
        "Keep this key safe! It has been saved to {}",
        config.paths.api_keys_file.display()
    );

    Ok(())
}

fn print_help() {
    println!(
        "{name} {version}

Usage:
  {name} [run]
  {name} generate-key --name <name> --email <email>

Commands:
  run              Run the gateway server (default)
  generate-key     Generate a new API key and store it in the key file

Options:
  -h, --help       Show this help message and exit
  -V, --version    Print version information

Configuration is read from the user config directory, a project-local
`gpu-gateway.toml`, `.secrets/app.toml`, and APP__-prefixed environment
variables.",
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
    );
}

fn print_version() {
    println!(
        "{name} {version}",
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_generate_key_options_requires_name_and_email() {
        let args = vec![
            "--name".to_string(),
            "alice".to_string(),
            "--email".to_string(),
            "alice@example.org".to_string(),
        ];

        let opts = parse_generate_key_options(&args).expect("parse");
        assert_eq!(opts.name, "alice");
        assert_eq!(opts.email, "alice@example.org");

        let missing = parse_generate_key_options(&["--name".to_string(), "bob".to_string()]);
        assert!(missing.is_err());
    }
}

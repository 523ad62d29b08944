mod admin_service;
mod config;
mod logging;
mod metrics;

use admin_service::{AdminError, AdminService};
use clap::{Parser, Subcommand};
use config::{Config, CredentialSeed};
use engine::Engine;
use engine::config_source::FileConfigSource;
use keypool::store::InMemoryCredentialStore;
use shared::http::run_http_service;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "keyrelay", about = "Credential routing for relayed provider calls")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, short)]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the engine, its background loops and the admin listener
    Run,
    /// Parse and validate the config file, then exit
    Validate,
    /// Probe every seeded credential and egress path once and print the result
    Probe,
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid config {}: {e}", cli.config.display());
            process::exit(1);
        }
    };

    if let CliCommand::Validate = cli.command {
        println!("Config is valid");
        return;
    }

    let _sentry = logging::init(&config.common.logging);
    if let Some(metrics_config) = &config.common.metrics {
        if let Err(e) = metrics::init(metrics_config) {
            tracing::error!(error = %e, "Metrics disabled");
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Could not start runtime: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        CliCommand::Run => runtime.block_on(run(config)),
        CliCommand::Probe => runtime.block_on(probe(config)),
        CliCommand::Validate => Ok(()),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Exiting");
        process::exit(1);
    }
}

fn build_engine(config: &Config) -> (Engine, Arc<InMemoryCredentialStore>) {
    let store = Arc::new(InMemoryCredentialStore::from_credentials(
        config.credentials.iter().map(CredentialSeed::to_credential),
    ));

    let mut builder = Engine::builder(config.policy.clone(), store.clone());
    if let Some(path) = &config.shared_config {
        builder = builder.config_source(Arc::new(FileConfigSource::new(path)));
    }
    (builder.build(), store)
}

async fn run(config: Config) -> Result<(), AdminError> {
    let (engine, store) = build_engine(&config);
    let engine = Arc::new(engine);

    let report = engine.start().await;
    tracing::info!(
        credentials = store.len(),
        started = ?report.started,
        "Engine started"
    );

    let admin = async {
        match &config.admin_listener {
            Some(listener) => {
                run_http_service(
                    &listener.host,
                    listener.port,
                    AdminService::new(engine.clone()),
                )
                .await
            }
            None => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        result = admin => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        }
    };

    engine.shutdown().await;
    result
}

async fn probe(config: Config) -> Result<(), AdminError> {
    let (engine, store) = build_engine(&config);
    engine.load_shared_config().await;

    match engine.trigger_probe_now().await {
        Ok(probed) => println!("Probed {probed} credential(s)"),
        Err(e) => println!("Credential probe failed: {e}"),
    }
    for seed in &config.credentials {
        if let Some(credential) = store.snapshot(seed.id) {
            println!(
                "  credential {} (owner {}): {} tier={:?} error={}",
                credential.id,
                credential.owner,
                credential.status,
                credential.tier,
                credential.last_error.as_deref().unwrap_or("-"),
            );
        }
    }

    let paths = engine.keepalive_now().await;
    println!("Probed {paths} egress path(s)");
    for row in engine.pool_snapshot() {
        println!(
            "  {}: available={} cooldown={}s error={}",
            row.proxy,
            row.is_available,
            row.cooldown_seconds,
            row.last_error.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

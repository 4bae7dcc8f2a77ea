// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::{path::Path, sync::Arc};

use clap::{Parser, Subcommand};
use common::prelude::{
    anyhow,
    rand::{self, Rng},
    tokio, tracing,
};
use dal::Stores;
use workflows::BackgroundServices;

#[derive(Parser, Debug)]
#[command(name = "runner-manager", author, version, about = "Distributed task manager")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the manager server
    Server,

    /// Mint a random API token suitable for AUTHORIZED_TOKENS__<name>
    GenerateToken,

    /// Hash an admin password for ADMIN_USERS__<name>
    HashPassword { password: String },
}

fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

fn setup_tracing(cfg: &config::ManagerConfig) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::from(cfg.log_level));

    if let Some(log_file) = cfg.log_file.clone() {
        let file = std::fs::File::create(&log_file).expect("couldn't open log file");
        let file = std::sync::Mutex::new(file);
        let subscriber = subscriber.with_writer(file).finish();
        tracing::subscriber::set_global_default(subscriber).expect("couldn't set up tracing");
    } else {
        let subscriber = subscriber.finish();
        tracing::subscriber::set_global_default(subscriber).expect("couldn't set up tracing");
    }
}

/// 1. load and validate configuration
/// 2. open the runner/task stores
/// 3. start background services and the SIGHUP reload listener
/// 4. serve the API until shutdown, then drain and persist
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::GenerateToken) => {
            println!("{}", generate_token());
            return Ok(());
        }
        Some(Command::HashPassword { password }) => {
            println!("{}", bcrypt::hash(password, bcrypt::DEFAULT_COST)?);
            return Ok(());
        }
        Some(Command::Server) | None => {}
    }

    let cfg = config::settings();
    cfg.validate()?;

    setup_tracing(&cfg);
    tracing::info!("starting runner manager");

    let stores = Arc::new(Stores::open(
        Path::new("data"),
        cfg.environment.is_production(),
    )?);
    tracing::info!(tasks = stores.tasks.len(), "state loaded");

    let background = BackgroundServices::start(stores.clone(), &cfg);

    // Config reload on SIGHUP; registered runners and tasks are untouched.
    tokio::spawn(async {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("failed to register SIGHUP reload handler: {e}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            let fresh = config::reload();
            if let Err(e) = fresh.validate() {
                tracing::error!("reloaded configuration is invalid: {e}");
            }
        }
    });

    let web_stores = stores.clone();
    tokio::select! {
        _ = libmanager::web::entry(web_stores) => {
            tracing::warn!("web server exited");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    background.stop().await;

    tracing::info!("saving tasks before exit");
    if let Err(e) = stores.tasks.save() {
        tracing::error!("failed to persist tasks at shutdown: {e}");
    }
    let (evicted, deleted) = stores.tasks.cleanup(config::settings().cleanup_task_files_days);
    tracing::info!(evicted, deleted, "shutdown cleanup finished");

    Ok(())
}

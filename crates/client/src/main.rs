// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::{collections::HashMap, time::Duration};

use clap::{Parser, Subcommand};
use client::ManagerClient;
use models::TaskRequest;

#[derive(Parser, Debug)]
#[command(name = "manager-client", about = "Command-line client for the runner manager")]
struct Cli {
    /// Manager base URL
    #[arg(long, env = "MANAGER_URL", default_value = "http://localhost:8000")]
    manager_url: String,

    /// API token
    #[arg(long, env = "MANAGER_API_TOKEN")]
    token: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check manager health and token validity
    Check,

    /// List registered runners with their online state
    Runners,

    /// Submit a task
    Submit {
        #[arg(long)]
        etab_name: String,
        #[arg(long)]
        app_name: String,
        #[arg(long)]
        app_version: Option<String>,
        #[arg(long)]
        task_type: String,
        #[arg(long)]
        source_url: String,
        #[arg(long)]
        notify_url: String,
        /// Task parameters as a JSON object
        #[arg(long, default_value = "{}")]
        parameters: String,
        /// Poll until the task reaches a final state
        #[arg(long)]
        wait: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 3600)]
        max_wait_seconds: u64,
    },

    /// Show one task
    Status { task_id: String },

    /// Fetch a finished task's result manifest
    Result { task_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = ManagerClient::new(&cli.manager_url, cli.token)?;

    match cli.command {
        Command::Check => {
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            let version = client.check_auth().await?;
            println!("{}", serde_json::to_string_pretty(&version)?);
        }

        Command::Runners => {
            let runners = client.runners().await?;
            if runners.is_empty() {
                println!("no runners registered");
            }
            for r in runners {
                println!(
                    "{}\t{}\t{}\t{}s since heartbeat",
                    r.id, r.status, r.url, r.age_seconds
                );
            }
        }

        Command::Submit {
            etab_name,
            app_name,
            app_version,
            task_type,
            source_url,
            notify_url,
            parameters,
            wait,
            max_wait_seconds,
        } => {
            let parameters: HashMap<String, serde_json::Value> =
                serde_json::from_str(&parameters)?;
            let request = TaskRequest {
                etab_name,
                app_name,
                app_version,
                task_type,
                source_url,
                affiliation: None,
                parameters,
                notify_url,
            };

            let task_id = client.submit_task(&request).await?;
            println!("{task_id}");

            if wait {
                let task = client
                    .wait_for_final_state(
                        &task_id,
                        Duration::from_secs(5),
                        Duration::from_secs(max_wait_seconds),
                    )
                    .await?;
                println!("{}", serde_json::to_string_pretty(&task)?);
            }
        }

        Command::Status { task_id } => {
            let task = client.task_status(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }

        Command::Result { task_id } => {
            let manifest = client.result_manifest(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
    }

    Ok(())
}

// huntwright workflow CLI - minimal engine controls: trigger, status,
// cancel, each a thin HTTP client against the Trigger Surface (src/api).

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "workflow")]
#[command(about = "huntwright workflow engine CLI")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the huntwright Trigger Surface HTTP API.
    #[arg(long, env = "WORKFLOW_API_URL", default_value = "http://localhost:8080")]
    api_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger a workflow execution for an article.
    Trigger {
        /// Article id to trigger.
        article_id: Uuid,
    },
    /// Print an execution's current state and stage summary.
    Status {
        /// Execution id to inspect.
        execution_id: Uuid,
    },
    /// Request early termination of a running execution.
    Cancel {
        /// Execution id to cancel.
        execution_id: Uuid,
    },
}

#[derive(Debug, Deserialize)]
struct TriggerResponse {
    execution_id: Uuid,
    accepted: bool,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StageResultView {
    stage_name: String,
    attempt: u32,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ExecutionView {
    status: String,
    termination_reason: Option<String>,
    discrete_huntables_count: Option<u32>,
    stage_results: Vec<StageResultView>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetailView,
}

#[derive(Debug, Deserialize)]
struct ErrorDetailView {
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Trigger { article_id } => {
            let url = format!("{}/workflow/articles/{article_id}/trigger", cli.api_url);
            let resp = client.post(&url).json(&serde_json::json!({})).send().await?;
            if resp.status().is_success() || resp.status() == reqwest::StatusCode::BAD_REQUEST {
                let body: TriggerResponse = resp.json().await?;
                if body.accepted {
                    println!("{} execution {}", "triggered".green(), body.execution_id);
                } else {
                    println!(
                        "{} execution {} is already active{}",
                        "not triggered:".yellow(),
                        body.execution_id,
                        body.reason.map(|r| format!(" ({r})")).unwrap_or_default()
                    );
                }
            } else {
                print_error(resp).await?;
            }
        }
        Commands::Status { execution_id } => {
            let url = format!("{}/workflow/executions/{execution_id}", cli.api_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let body: ExecutionView = resp.json().await?;
                println!("execution {execution_id}: {}", status_color(&body.status));
                if let Some(reason) = body.termination_reason {
                    println!("  termination_reason: {reason}");
                }
                if let Some(count) = body.discrete_huntables_count {
                    println!("  discrete_huntables_count: {count}");
                }
                for stage in body.stage_results {
                    println!("  [{}] attempt {}: {}", stage.stage_name, stage.attempt, status_color(&stage.status));
                }
            } else {
                print_error(resp).await?;
            }
        }
        Commands::Cancel { execution_id } => {
            let url = format!("{}/workflow/executions/{execution_id}/cancel", cli.api_url);
            let resp = client.post(&url).send().await?;
            if resp.status() == reqwest::StatusCode::ACCEPTED {
                println!("{} cancellation requested for {execution_id}", "accepted:".green());
            } else {
                print_error(resp).await?;
            }
        }
    }

    Ok(())
}

fn status_color(status: &str) -> colored::ColoredString {
    match status {
        "completed" | "succeeded" => status.green(),
        "failed" | "timed_out" => status.red(),
        "terminated_early" => status.yellow(),
        _ => status.normal(),
    }
}

async fn print_error(resp: reqwest::Response) -> anyhow::Result<()> {
    let status = resp.status();
    match resp.json::<ErrorEnvelope>().await {
        Ok(body) => eprintln!("{} {} ({status})", "error:".red(), body.error.message),
        Err(_) => eprintln!("{} request failed with status {status}", "error:".red()),
    }
    Ok(())
}

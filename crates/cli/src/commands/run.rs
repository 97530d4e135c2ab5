//! Run Commands

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde::Serialize;
use stepwise_common::{ActiveRunInfo, BrowserKind, Run, RunEvent, RunEventKind, RunStatus, StepResult, StepStatus};
use stepwise_engine::{EngineConfig, RunOrchestrator, RunSettings};
use tokio::sync::broadcast::error::RecvError;

use crate::output::{
    format_millis, print_info, print_item, print_list, print_message, print_success, print_warning, run_status_label,
    step_status_label, OutputFormat, TableDisplay,
};

#[derive(Subcommand)]
pub enum RunCommands {
    /// Run a test case and follow it until it finishes
    Start {
        /// Test case ID
        case: String,

        /// Browser engine, defaults to the configured browser
        #[arg(short, long)]
        browser: Option<BrowserKind>,

        /// Keep going after a failed step
        #[arg(long)]
        continue_on_failure: bool,

        /// Per-step timeout in milliseconds
        #[arg(long)]
        step_timeout_ms: Option<u64>,
    },

    /// List the runs of a test case, oldest first
    History {
        /// Test case ID
        case: String,
    },

    /// Show the step results of a run
    Results {
        /// Run ID
        run: String,
    },

    /// Show the run still marked as running, if any
    Active,

    /// Copy a step screenshot out of the artifacts store
    Screenshot {
        /// Screenshot path as recorded on the step result
        path: PathBuf,

        /// Copy the thumbnail instead of the full screenshot
        #[arg(long)]
        thumbnail: bool,

        /// Destination file
        #[arg(short, long)]
        out: PathBuf,
    },
}

impl TableDisplay for Run {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Browser", "Status", "Started", "Ended"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.browser.to_string(),
            run_status_label(self.status),
            format_millis(self.started_at),
            self.ended_at.map(format_millis).unwrap_or_else(|| "-".to_string()),
        ]
    }
}

impl TableDisplay for StepResult {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Step", "Status", "Error", "Screenshot"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.step_order.to_string(),
            self.raw_text.clone(),
            step_status_label(self.status),
            self.error_text.clone().unwrap_or_default(),
            self.screenshot_path.clone().unwrap_or_default(),
        ]
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActiveDisplay {
    run_id: String,
    test_case_id: String,
    browser: String,
    started_at: i64,
}

impl From<ActiveRunInfo> for ActiveDisplay {
    fn from(info: ActiveRunInfo) -> Self {
        Self {
            run_id: info.run_id,
            test_case_id: info.test_case_id,
            browser: info.browser.to_string(),
            started_at: info.started_at,
        }
    }
}

impl TableDisplay for ActiveDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Run", "Test Case", "Browser", "Started"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.run_id.clone(),
            self.test_case_id.clone(),
            self.browser.clone(),
            format_millis(self.started_at),
        ]
    }
}

/// Execute a run command. Returns false when a started run did not pass.
pub async fn execute(
    cmd: RunCommands,
    orchestrator: &RunOrchestrator,
    config: &EngineConfig,
    format: OutputFormat,
) -> Result<bool> {
    match cmd {
        RunCommands::Start {
            case,
            browser,
            continue_on_failure,
            step_timeout_ms,
        } => {
            let defaults = orchestrator.settings();
            orchestrator.update_settings(RunSettings {
                step_timeout_ms: step_timeout_ms.unwrap_or(defaults.step_timeout_ms),
                continue_on_failure: continue_on_failure || defaults.continue_on_failure,
                ..defaults
            });
            let browser = browser.unwrap_or(config.browser.default_browser);
            let status = follow_run(orchestrator, &case, browser, format).await?;
            return Ok(status == RunStatus::Passed);
        }

        RunCommands::History { case } => {
            let runs = orchestrator.history(&case)?;
            print_list(&runs, format);
        }

        RunCommands::Results { run } => {
            orchestrator.status(&run)?;
            let results = orchestrator.step_results(&run)?;
            print_list(&results, format);
        }

        RunCommands::Active => match orchestrator.active_context()? {
            Some(info) => print_item(&ActiveDisplay::from(info), format),
            None => print_message("No run in progress.", format),
        },

        RunCommands::Screenshot { path, thumbnail, out } => {
            let bytes = if thumbnail {
                orchestrator.read_thumbnail(&path)?
            } else {
                orchestrator.read_screenshot(&path)?
            };
            std::fs::write(&out, &bytes).with_context(|| format!("writing {}", out.display()))?;
            print_success(&format!("Wrote {} bytes to {}", bytes.len(), out.display()));
        }
    }

    Ok(true)
}

/// Start a run and print its events until it finishes. Ctrl-C cancels it.
async fn follow_run(
    orchestrator: &RunOrchestrator,
    case: &str,
    browser: BrowserKind,
    format: OutputFormat,
) -> Result<RunStatus> {
    let step_text: HashMap<String, String> = orchestrator
        .db()
        .list_steps(case)?
        .into_iter()
        .map(|step| (step.id, step.raw_text))
        .collect();

    let mut events = orchestrator.subscribe();
    let run = orchestrator.start(case, browser).await?;
    let mut cancelling = false;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !cancelling => {
                signal?;
                cancelling = true;
                print_warning("Cancelling run...");
                if !orchestrator.cancel(&run.id).await {
                    tracing::debug!(run_id = %run.id, "run finished before cancel");
                }
            }
            received = events.recv() => match received {
                Ok(event) if event.run_id == run.id => {
                    print_event(&event, &step_text, format);
                    if event.is_terminal() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let finished = orchestrator.status(&run.id)?;
    if matches!(format, OutputFormat::Table | OutputFormat::Plain) {
        let results = orchestrator.step_results(&run.id)?;
        print_list(&results, format);
    }
    Ok(finished.status)
}

fn print_event(event: &RunEvent, step_text: &HashMap<String, String>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(event).unwrap_or_default());
            return;
        }
        OutputFormat::Yaml => {
            println!("---\n{}", serde_yaml::to_string(event).unwrap_or_default().trim_end());
            return;
        }
        OutputFormat::Table | OutputFormat::Plain => {}
    }

    let text = |id: &str| step_text.get(id).map(String::as_str).unwrap_or("");
    match &event.kind {
        RunEventKind::RunStarted { browser, .. } => {
            print_info(&format!("Run {} started on {}", event.run_id, browser));
        }
        RunEventKind::StepStarted { step_id, step_order } => {
            println!("  {} {}", format!("[{}]", step_order).dimmed(), text(step_id));
        }
        RunEventKind::StepFinished {
            step_id,
            step_order,
            step_status,
            message,
            ..
        } => {
            let mark = match step_status {
                StepStatus::Passed => "✔".green(),
                StepStatus::Failed => "✘".red(),
                _ => "-".dimmed(),
            };
            println!("  {} [{}] {}", mark, step_order, text(step_id));
            if let Some(message) = message {
                println!("      {}", message.red());
            }
        }
        RunEventKind::RunFinished { run_status, message } => {
            println!("{} {}", run_status_label(*run_status), message);
        }
    }
}

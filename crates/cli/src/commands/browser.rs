//! Browser Engine Commands

use anyhow::Result;
use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use stepwise_common::{BrowserInstallState, BrowserKind, InstallPhase};
use stepwise_engine::RunOrchestrator;
use tokio::sync::broadcast::error::RecvError;

use crate::output::{print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum BrowserCommands {
    /// Show installation state of browser engines
    Status {
        /// Only this engine
        browser: Option<BrowserKind>,
    },

    /// Install a browser engine
    Install {
        /// Engine to install
        browser: BrowserKind,
    },
}

#[derive(Serialize)]
#[serde(transparent)]
struct StateDisplay(BrowserInstallState);

impl TableDisplay for StateDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Browser", "Installed", "Installing", "Executable", "Last Error"]
    }

    fn row(&self) -> Vec<String> {
        let state = &self.0;
        vec![
            state.browser.to_string(),
            if state.installed { "yes" } else { "no" }.to_string(),
            if state.install_in_progress { "yes" } else { "no" }.to_string(),
            state
                .executable_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            state.last_error.clone().unwrap_or_default(),
        ]
    }
}

pub async fn execute(cmd: BrowserCommands, orchestrator: &RunOrchestrator, format: OutputFormat) -> Result<()> {
    let runtime = orchestrator.runtime();
    match cmd {
        BrowserCommands::Status { browser } => {
            let kinds = match browser {
                Some(kind) => vec![kind],
                None => BrowserKind::ALL.to_vec(),
            };
            let mut states = Vec::with_capacity(kinds.len());
            for kind in kinds {
                states.push(StateDisplay(runtime.get_status(kind).await));
            }
            print_list(&states, format);
        }

        BrowserCommands::Install { browser } => {
            let mut events = runtime.subscribe();
            let mut install = {
                let runtime = runtime.clone();
                tokio::spawn(async move { runtime.install(browser).await })
            };

            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {wide_msg}")?
                    .progress_chars("=>-"),
            );

            let mut listening = true;
            let state = loop {
                tokio::select! {
                    joined = &mut install => break joined?,
                    received = events.recv(), if listening => match received {
                        Ok(event) if event.browser == browser => {
                            if let Some(progress) = event.progress {
                                bar.set_position(u64::from(progress));
                            }
                            bar.set_message(event.message);
                            if event.phase == InstallPhase::Failed {
                                bar.abandon();
                            }
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => listening = false,
                    }
                }
            };

            let state = match state {
                Ok(state) => state,
                Err(e) => {
                    bar.abandon();
                    return Err(e.into());
                }
            };
            bar.finish_and_clear();
            match &state.executable_path {
                Some(path) => print_success(&format!("{} installed at {}", browser, path.display())),
                None => print_success(&format!("{} installed", browser)),
            }
        }
    }

    Ok(())
}

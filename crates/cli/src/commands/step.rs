//! Step Commands

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::Subcommand;
use stepwise_common::{Action, Step};
use stepwise_engine::{interpreter, RunOrchestrator};

use crate::output::{print_error, print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum StepCommands {
    /// List the steps of a test case in order
    List {
        /// Test case ID
        case: String,
    },

    /// Append a step to a test case
    Add {
        /// Test case ID
        case: String,

        /// Step text, e.g. `Click "Sign in" button`
        text: String,

        /// Store this structured action instead of parsing the text
        #[arg(long)]
        action_json: Option<String>,
    },

    /// Replace every step of a test case with the lines of a file
    Replace {
        /// Test case ID
        case: String,

        /// File with one step per line. Blank lines and lines starting
        /// with `#` are skipped.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Delete a step
    Delete {
        /// Step ID
        id: String,
    },
}

impl TableDisplay for Step {
    fn headers() -> Vec<&'static str> {
        vec!["#", "ID", "Step", "Action"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.step_order.to_string(),
            self.id.clone(),
            self.raw_text.clone(),
            self.action.kind().to_string(),
        ]
    }
}

/// Print how `text` parses. Returns false when it does not.
pub fn parse_text(text: &str, format: OutputFormat) -> bool {
    match interpreter::parse(text) {
        Ok(action) => {
            let rendered = match format {
                OutputFormat::Yaml => serde_yaml::to_string(&action).unwrap_or_default(),
                _ => serde_json::to_string_pretty(&action).unwrap_or_default(),
            };
            println!("{}", rendered.trim_end());
            true
        }
        Err(e) => {
            print_error(&e.to_string());
            false
        }
    }
}

/// Step lines of a script file paired with their parsed actions. Every
/// unparseable line is reported before failing.
fn load_script(path: &Path) -> Result<Vec<(String, Action)>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_script(&content)
}

fn parse_script(content: &str) -> Result<Vec<(String, Action)>> {
    let mut steps = Vec::new();
    let mut errors = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match interpreter::parse(line) {
            Ok(action) => steps.push((line.to_string(), action)),
            Err(e) => errors.push(format!("line {}: {}", index + 1, e)),
        }
    }

    if !errors.is_empty() {
        bail!("{}", errors.join("\n"));
    }
    if steps.is_empty() {
        bail!("no steps found");
    }
    Ok(steps)
}

pub fn execute(cmd: StepCommands, orchestrator: &RunOrchestrator, format: OutputFormat) -> Result<()> {
    let db = orchestrator.db();
    match cmd {
        StepCommands::List { case } => {
            db.get_test_case(&case)?
                .ok_or_else(|| anyhow!("test case not found: {}", case))?;
            let steps = db.list_steps(&case)?;
            print_list(&steps, format);
        }

        StepCommands::Add {
            case,
            text,
            action_json,
        } => {
            let text = text.trim();
            let action = match action_json {
                Some(json) => serde_json::from_str::<Action>(&json).context("invalid --action-json")?,
                None => interpreter::parse(text)?,
            };
            let step = db.add_step(&case, text, &action)?;
            print_item(&step, format);
        }

        StepCommands::Replace { case, file } => {
            let steps = load_script(&file)?;
            let stored = db.replace_steps(&case, &steps)?;
            print_list(&stored, format);
        }

        StepCommands::Delete { id } => {
            if db.delete_step(&id)? {
                print_success(&format!("Step {} deleted", id));
            } else {
                bail!("step not found: {}", id);
            }
        }
    }

    Ok(())
}

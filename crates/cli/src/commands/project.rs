//! Project Commands

use anyhow::{bail, Result};
use clap::Subcommand;
use stepwise_common::Project;
use stepwise_engine::RunOrchestrator;

use crate::output::{format_millis, print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// List all projects
    List,

    /// Create a project
    Add {
        /// Project name
        name: String,

        /// Base URL every run of the project starts from
        base_url: String,
    },

    /// Delete a project with its test cases and runs
    Delete {
        /// Project ID
        id: String,
    },
}

impl TableDisplay for Project {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Base URL", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.base_url.clone(),
            format_millis(self.created_at),
        ]
    }
}

/// Only absolute http(s) URLs can be opened by a run
fn validate_base_url(raw: &str) -> Result<String> {
    let url = url::Url::parse(raw.trim())?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("base URL must use http or https, got {}", url.scheme());
    }
    Ok(url.to_string())
}

pub fn execute(cmd: ProjectCommands, orchestrator: &RunOrchestrator, format: OutputFormat) -> Result<()> {
    let db = orchestrator.db();
    match cmd {
        ProjectCommands::List => {
            let projects = db.list_projects()?;
            print_list(&projects, format);
        }

        ProjectCommands::Add { name, base_url } => {
            let base_url = validate_base_url(&base_url)?;
            let project = db.create_project(name.trim(), &base_url)?;
            print_item(&project, format);
        }

        ProjectCommands::Delete { id } => {
            if db.delete_project(&id)? {
                print_success(&format!("Project {} deleted", id));
            } else {
                bail!("project not found: {}", id);
            }
        }
    }

    Ok(())
}

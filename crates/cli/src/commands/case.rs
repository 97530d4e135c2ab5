//! Test Case Commands

use anyhow::{anyhow, bail, Result};
use clap::Subcommand;
use stepwise_common::TestCase;
use stepwise_engine::RunOrchestrator;

use crate::output::{format_millis, print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum CaseCommands {
    /// List the test cases of a project
    List {
        /// Project ID
        project: String,
    },

    /// Create a test case
    Add {
        /// Project ID
        project: String,

        /// Test case title
        title: String,
    },

    /// Delete a test case with its steps and runs
    Delete {
        /// Test case ID
        id: String,
    },
}

impl TableDisplay for TestCase {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Title", "Project", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.title.clone(),
            self.project_id.clone(),
            format_millis(self.created_at),
        ]
    }
}

pub fn execute(cmd: CaseCommands, orchestrator: &RunOrchestrator, format: OutputFormat) -> Result<()> {
    let db = orchestrator.db();
    match cmd {
        CaseCommands::List { project } => {
            db.get_project(&project)?
                .ok_or_else(|| anyhow!("project not found: {}", project))?;
            let cases = db.list_test_cases(&project)?;
            print_list(&cases, format);
        }

        CaseCommands::Add { project, title } => {
            let test_case = db.create_test_case(&project, title.trim())?;
            print_item(&test_case, format);
        }

        CaseCommands::Delete { id } => {
            if db.delete_test_case(&id)? {
                print_success(&format!("Test case {} deleted", id));
            } else {
                bail!("test case not found: {}", id);
            }
        }
    }

    Ok(())
}

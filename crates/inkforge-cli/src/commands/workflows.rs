//! `inkforge workflows` - inspect registered workflows

use clap::Subcommand;

use crate::client::Client;
use crate::output::{print_error, print_structured, OutputFormat};

#[derive(Subcommand)]
pub enum WorkflowsCommand {
    /// List registered workflow types
    List,

    /// Show a workflow's parameter schema
    Show {
        /// Workflow type name
        workflow_type: String,
    },
}

pub async fn run(client: &Client, format: OutputFormat, command: WorkflowsCommand) -> i32 {
    match command {
        WorkflowsCommand::List => match client.list_workflows().await {
            Ok(workflows) => {
                if !print_structured(format, &workflows) {
                    for wf in &workflows {
                        println!(
                            "{:<24} {:<8} {}",
                            wf.workflow_type, wf.version, wf.description
                        );
                    }
                }
                0
            }
            Err(e) => {
                print_error(&e);
                e.exit_code()
            }
        },

        WorkflowsCommand::Show { workflow_type } => match client.get_workflow(&workflow_type).await
        {
            Ok(detail) => {
                if !print_structured(format, &detail) {
                    println!("{} ({})", detail.metadata.name, detail.metadata.workflow_type);
                    println!("{}", detail.metadata.description);
                    println!();
                    println!("parameters:");
                    for param in &detail.params {
                        let required = if param.required { "required" } else { "optional" };
                        let default = param
                            .default
                            .as_ref()
                            .map(|d| format!(" (default: {d})"))
                            .unwrap_or_default();
                        println!(
                            "  --param {}=<{:?}>  [{required}]{default}",
                            camel_to_kebab(&param.name),
                            param.param_type,
                        );
                        if !param.description.is_empty() {
                            println!("      {}", param.description);
                        }
                    }
                }
                0
            }
            Err(e) => {
                print_error(&e);
                e.exit_code()
            }
        },
    }
}

/// `maxTextRetries` -> `max-text-retries`
fn camel_to_kebab(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_uppercase() {
            out.push('-');
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

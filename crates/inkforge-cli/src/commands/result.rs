//! `inkforge result` - fetch a completed task's artifacts

use uuid::Uuid;

use crate::client::{Client, ClientError};
use crate::output::{print_error, print_structured, OutputFormat};

pub async fn run(client: &Client, format: OutputFormat, task_id: Uuid) -> i32 {
    match client.get_task_result(task_id).await {
        Ok(response) => {
            if !print_structured(format, &response) {
                if response.results.is_empty() {
                    println!("no results");
                }
                for (i, row) in response.results.iter().enumerate() {
                    println!("--- result {} ({}) ---", i + 1, row.result_type);
                    if let Some(content) = &row.content {
                        println!("{content}");
                    }
                    if let Some(path) = &row.file_path {
                        println!("file: {path}");
                    }
                }
            }
            0
        }
        // Not ready yet is exit 1, not a hard failure
        Err(ClientError::Api { code, message, .. }) if code == "NotReady" => {
            eprintln!("not ready: {message}");
            1
        }
        Err(e) => {
            print_error(&e);
            e.exit_code()
        }
    }
}

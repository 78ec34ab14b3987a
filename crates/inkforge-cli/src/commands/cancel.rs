//! `inkforge cancel` - cancel a task

use uuid::Uuid;

use crate::client::Client;
use crate::output::{print_error, print_structured, OutputFormat};

pub async fn run(client: &Client, format: OutputFormat, quiet: bool, task_id: Uuid) -> i32 {
    match client.cancel_task(task_id).await {
        Ok(response) => {
            if !print_structured(format, &response) && !quiet {
                if response.cancelled {
                    println!("cancellation accepted");
                } else {
                    println!("task could not be cancelled (already settled?)");
                }
            }
            if response.cancelled {
                0
            } else {
                1
            }
        }
        Err(e) => {
            print_error(&e);
            e.exit_code()
        }
    }
}

//! `inkforge status` - show a task record

use uuid::Uuid;

use crate::client::Client;
use crate::output::{print_error, print_structured, OutputFormat};

pub async fn run(client: &Client, format: OutputFormat, task_id: Uuid) -> i32 {
    match client.get_task(task_id).await {
        Ok(task) => {
            if !print_structured(format, &task) {
                println!("task:          {}", task.task_id);
                println!("workflow:      {}", task.workflow_type);
                println!("status:        {}", task.status);
                if let Some(step) = &task.current_step {
                    println!("current step:  {step}");
                }
                println!("progress:      {}%", task.progress);
                println!("created:       {}", task.created_at);
                if let Some(started) = &task.started_at {
                    println!("started:       {started}");
                }
                if let Some(completed) = &task.completed_at {
                    println!("completed:     {completed}");
                }
                if let Some(error) = &task.error_message {
                    println!("error:         {error}");
                }
            }
            0
        }
        Err(e) => {
            print_error(&e);
            e.exit_code()
        }
    }
}

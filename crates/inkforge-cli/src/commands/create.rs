//! `inkforge create` - submit a workflow task
//!
//! CLI flags use kebab-case; workflow parameters are camelCase. The mapper
//! converts keys and parses scalar values according to the parameter types
//! declared by the workflow's schema.

use serde_json::{json, Map, Value};

use crate::client::{Client, ParamInfo};
use crate::output::{print_error, print_structured, OutputFormat};

pub struct CreateArgs {
    pub workflow_type: String,
    pub mode: String,
    pub params: Vec<String>,
    pub idempotency_key: Option<String>,
    pub priority: Option<u8>,
    pub callback_url: Option<String>,
    pub schedule_at: Option<String>,
}

pub async fn run(client: &Client, format: OutputFormat, quiet: bool, args: CreateArgs) -> i32 {
    // Fetch the declared schema so scalar values parse per their types
    let schema = match client.get_workflow(&args.workflow_type).await {
        Ok(detail) => detail.params,
        Err(e) => {
            print_error(&e);
            return e.exit_code();
        }
    };

    let params = match build_params(&args.params, &schema) {
        Ok(params) => params,
        Err(message) => {
            eprintln!("error: {message}");
            return 2;
        }
    };

    let mut body = json!({
        "workflow_type": args.workflow_type,
        "mode": args.mode,
        "params": params,
    });
    if let Some(key) = &args.idempotency_key {
        body["idempotency_key"] = json!(key);
    }
    if let Some(priority) = args.priority {
        body["priority"] = json!(priority);
    }
    if let Some(schedule_at) = &args.schedule_at {
        body["schedule_at"] = json!(schedule_at);
    }
    if let Some(url) = &args.callback_url {
        body["callback"] = json!({ "url": url });
    }

    match client.create_task(body).await {
        Ok(response) => {
            if !print_structured(format, &response) {
                if quiet {
                    println!("{}", response.task_id);
                } else {
                    println!("task:   {}", response.task_id);
                    println!("status: {}", response.status);
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

/// Convert `key=value` pairs into a typed parameter object
fn build_params(pairs: &[String], schema: &[ParamInfo]) -> Result<Map<String, Value>, String> {
    let mut params = Map::new();

    for pair in pairs {
        let (raw_key, raw_value) = pair
            .split_once('=')
            .ok_or_else(|| format!("parameter '{pair}' is not KEY=VALUE"))?;

        let key = kebab_to_camel(raw_key);
        let value = match schema.iter().find(|p| p.name == key) {
            Some(info) => info
                .param_type
                .parse_str(raw_value)
                .map_err(|e| format!("parameter '{raw_key}': {e}"))?,
            // Undeclared keys pass through as strings
            None => Value::String(raw_value.to_string()),
        };
        params.insert(key, value);
    }

    Ok(params)
}

/// `max-text-retries` -> `maxTextRetries` (already-camelCase keys pass through)
fn kebab_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

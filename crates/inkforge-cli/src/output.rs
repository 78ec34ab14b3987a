//! Output formatting

use serde::Serialize;

/// Supported output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s {
            "json" => Self::Json,
            "yaml" => Self::Yaml,
            _ => Self::Text,
        }
    }
}

/// Print a value in the structured formats; the caller handles text
pub fn print_structured<T: Serialize>(format: OutputFormat, value: &T) -> bool {
    match format {
        OutputFormat::Json => {
            match serde_json::to_string_pretty(value) {
                Ok(s) => println!("{s}"),
                Err(e) => eprintln!("serialization error: {e}"),
            }
            true
        }
        OutputFormat::Yaml => {
            match serde_yaml::to_string(value) {
                Ok(s) => print!("{s}"),
                Err(e) => eprintln!("serialization error: {e}"),
            }
            true
        }
        OutputFormat::Text => false,
    }
}

/// Print an error consistently
pub fn print_error(err: &crate::client::ClientError) {
    eprintln!("error: {err}");
}

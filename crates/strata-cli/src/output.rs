use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;

use crate::cli::OutputFormat;

pub fn print_value<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    let value = serde_json::to_value(value)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
        OutputFormat::Table => print_fields(&value)?,
    }
    Ok(())
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Objects as aligned `field: value` lines; anything else as compact JSON.
fn print_fields(value: &Value) -> Result<()> {
    let Some(obj) = value.as_object() else {
        println!("{}", serde_json::to_string(value)?);
        return Ok(());
    };
    let width = obj.keys().map(String::len).max().unwrap_or(0);
    for (field, v) in obj {
        let rendered = match v {
            Value::String(s) => s.clone(),
            Value::Null => "-".to_string(),
            other => serde_json::to_string(other)?,
        };
        println!("{:width$}  {}", field.cyan(), rendered);
    }
    Ok(())
}

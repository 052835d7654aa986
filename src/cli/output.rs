//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::BlockError;
use owo_colors::OwoColorize;
use serde_json::Value;

/// Map a block error to a single CLI line, with the offending selector when known.
pub fn map_error(e: &BlockError) -> String {
    let selector = e
        .data()
        .get("selector")
        .and_then(Value::as_str)
        .map(str::to_string);
    match selector {
        Some(selector) => format!("{} {} ({})", "error:".red().bold(), e, selector),
        None => format!("{} {}", "error:".red().bold(), e),
    }
}

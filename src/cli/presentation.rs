//! CLI presentation: text and json formatters per command.

use crate::condition::ConditionResult;
use crate::sandbox::ExecutionResult;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub fn format_section_heading(title: &str) -> String {
    format!("{}", title.bold().underline())
}

/// One matched element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRow {
    pub tag: String,
    pub id: Option<String>,
    pub text: String,
}

/// Outcome of `turium resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveReport {
    pub selector: String,
    pub frame_hops: usize,
    /// The target lived behind a message-only frame.
    pub relayed: bool,
    pub matches: Vec<MatchRow>,
}

pub fn format_resolve_text(report: &ResolveReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n\n", format_section_heading("Selector")));
    out.push_str(&format!("  Chain: {}\n", report.selector));
    out.push_str(&format!("  Frame hops: {}\n", report.frame_hops));
    if report.relayed {
        out.push_str(&format!("  Relayed: {}\n", "yes".yellow()));
    }
    out.push('\n');
    if report.matches.is_empty() {
        out.push_str(&format!("{}\n", "No matching elements.".red()));
        return out;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["#", "Tag", "Id", "Text"]);
    for (index, row) in report.matches.iter().enumerate() {
        table.add_row(vec![
            index.to_string(),
            row.tag.clone(),
            row.id.clone().unwrap_or_else(|| "-".to_string()),
            row.text.clone(),
        ]);
    }
    out.push_str(&format!("{}\n", table));
    out.push_str(&format!("\nTotal: {} match(es)", report.matches.len().green()));
    out
}

pub fn format_resolve_json(report: &ResolveReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}

pub fn format_condition_result(kind: &str, result: &ConditionResult) -> String {
    let value = match result {
        ConditionResult::Bool(true) => format!("{}", "true".green()),
        ConditionResult::Bool(false) => format!("{}", "false".red()),
        ConditionResult::Null => format!("{}", "null".dimmed()),
        ConditionResult::Text(text) => json!(text).to_string(),
        ConditionResult::Value(value) => value.to_string(),
    };
    format!("{}: {}", kind, value)
}

pub fn format_execution_result(result: &ExecutionResult) -> String {
    serde_json::to_string_pretty(result).unwrap_or_else(|_| "{}".to_string())
}

pub fn format_purge_result(purged: usize, remaining: usize) -> String {
    format!("Purged {} token(s); {} remaining", purged, remaining)
}

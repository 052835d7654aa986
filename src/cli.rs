//! CLI domain: parse, route, output and presentation only.
//! Route handlers stay thin; the content runtime and sandbox do the work.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, TokenCommands};
pub use presentation::{
    format_condition_result, format_execution_result, format_purge_result,
    format_resolve_json, format_resolve_text, format_section_heading, MatchRow, ResolveReport,
};
pub use route::RunContext;

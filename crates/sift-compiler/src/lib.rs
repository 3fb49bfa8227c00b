//! Sift Filter List Compiler
//!
//! This crate converts EasyList-style subscriptions into a `CompiledFilterSet`.

pub mod diff;
pub mod header;
pub mod optimizer;
pub mod parser;

pub use diff::{compile_delta, compile_snapshot, diff_lines, FilterDelta, LineDiff};
pub use header::{extract_version, ListHeader};
pub use optimizer::{optimize, OptimizeStats};
pub use parser::{convert_line, convert_lines, parse_filter_list, LineOutcome, ParseStats};

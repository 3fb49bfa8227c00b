use std::fs;
use std::path::Path;
use std::time::Instant;

use sift_compiler::{compile_snapshot, optimize, ParseStats};
use sift_core::CompiledFilterSet;

#[derive(Debug, Clone, Default)]
pub struct CompileStats {
    pub lists: usize,
    pub lines: usize,
    pub invalid: usize,
    pub rules: usize,
    pub network_rules: usize,
    pub cosmetic_exceptions: usize,
    pub total_ms: f64,
}

impl CompileStats {
    fn add(&mut self, stats: &ParseStats) {
        self.lines += stats.lines;
        self.invalid += stats.invalid;
        self.cosmetic_exceptions += stats.cosmetic_exceptions;
    }
}

/// Compile local list files into one set, the same way downloaded
/// subscriptions are compiled.
pub fn compile_files(inputs: &[String], verbose: bool) -> Result<(CompiledFilterSet, CompileStats), String> {
    if inputs.is_empty() {
        return Err("No input files specified".to_string());
    }

    let start = Instant::now();
    let mut merged = CompiledFilterSet::new(format!("local-{}", inputs.len()));
    let mut stats = CompileStats::default();

    for (index, path) in inputs.iter().enumerate() {
        let content = fs::read(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?;
        let (set, parsed) = compile_snapshot(&String::from_utf8_lossy(&content));

        if verbose {
            println!(
                "  [{}] {} - {} lines, {} network, {} cosmetic, {} invalid",
                index,
                Path::new(path).file_name().unwrap_or_default().to_string_lossy(),
                parsed.lines,
                parsed.network,
                parsed.cosmetic,
                parsed.invalid
            );
        }

        stats.add(&parsed);
        merged.merge(set);
    }

    stats.lists = inputs.len();
    stats.rules = merged.rule_count();
    stats.network_rules = merged.network_len();
    stats.total_ms = start.elapsed().as_secs_f64() * 1000.0;
    Ok((merged, stats))
}

/// Deduplicated content-blocker payload for `set`.
pub fn payload_bytes(set: &CompiledFilterSet) -> Result<(Vec<u8>, usize), String> {
    let mut optimized = set.clone();
    let stats = optimize(&mut optimized);
    let bytes = optimized
        .to_content_blocker_json()
        .map_err(|e| format!("Failed to encode payload: {}", e))?;
    Ok((bytes, stats.deduped))
}

pub fn write_file(path: &Path, bytes: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create '{}': {}", parent.display(), e))?;
    }
    fs::write(path, bytes).map_err(|e| format!("Failed to write '{}': {}", path.display(), e))
}

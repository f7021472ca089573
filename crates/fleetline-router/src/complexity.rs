use serde::{Deserialize, Serialize};

/// A task description sufficient to score routing complexity (spec 4.L).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_type: String,
    #[serde(default)]
    pub context_tokens: u64,
    #[serde(default)]
    pub files: Vec<String>,
    /// Whether a weak-tier model has already failed this kind of task in
    /// recent history; feeds the historical-failure factor.
    #[serde(default)]
    pub weak_tier_recent_failure: bool,
}

/// Fixed base-complexity mapping for known task types (spec 4.L, factor
/// 2 of 4). Unlisted types fall back to the `code_implementation` weight.
fn base_complexity(task_type: &str) -> u8 {
    match task_type {
        "log_summary" => 1,
        "simple_edit" => 2,
        "code_implementation" => 3,
        "architecture_design" => 4,
        "multi_file_refactor" => 4,
        _ => 3,
    }
}

fn context_window_factor(context_tokens: u64) -> u8 {
    match context_tokens {
        0..=2_000 => 0,
        2_001..=10_000 => 1,
        10_001..=50_000 => 2,
        _ => 3,
    }
}

fn file_count_factor(files: usize) -> u8 {
    match files {
        0..=1 => 0,
        2..=5 => 1,
        _ => 2,
    }
}

/// Total complexity score in `1..=10`, the sum of: context window (0-3),
/// task-type base complexity (1-4), file count (0-2), historical
/// weak-tier failure (0-1).
pub fn score(task: &TaskSpec) -> u8 {
    let context = context_window_factor(task.context_tokens);
    let base = base_complexity(&task.task_type);
    let files = file_count_factor(task.files.len());
    let history = if task.weak_tier_recent_failure { 1 } else { 0 };
    (context + base + files + history).min(10)
}

use std::path::Path;

use fleetline_core::Operation;

/// A single tool invocation's shape, independent of the permission profile
/// that judges it — enough to compute a risk score (spec 4.K item 2).
#[derive(Debug, Clone)]
pub struct ToolInvocation<'a> {
    pub operation: Operation,
    pub path: Option<&'a Path>,
    pub requires_bash: bool,
    pub requires_network: bool,
    pub command: Option<&'a str>,
    pub payload_bytes: usize,
    pub modifies_tests: bool,
    pub outside_project: bool,
}

/// Destructive command substrings, checked verbatim from
/// `original_source/src/orchestration/tool_proxy.py`.
const DESTRUCTIVE_SUBSTRINGS: &[&str] = &["rm -rf", "git reset --hard", "sudo "];

const LARGE_WRITE_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, Default)]
pub struct RiskBreakdown {
    pub score: f64,
    pub reasons: Vec<String>,
}

fn is_dotfile(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

fn is_dependency_manifest(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    matches!(
        name,
        "Cargo.toml" | "Cargo.lock" | "package.json" | "package-lock.json" | "pyproject.toml" | "poetry.lock" | "requirements.txt"
    )
}

fn is_build_config(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    matches!(name, "Makefile" | "build.rs" | "Dockerfile" | "docker-compose.yml" | "docker-compose.yaml")
}

fn is_permissions_config(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.contains("permission") || name.contains("profile")
}

/// Sums the weighted signals and clamps to `[0, 1]` (spec 4.K item 2,
/// SPEC_FULL §3). Pre-clamp magnitude is discarded — Open Question 3.
pub fn score(call: &ToolInvocation<'_>) -> RiskBreakdown {
    let mut total = 0.0f64;
    let mut reasons = Vec::new();

    let mut add = |weight: f64, reason: &str| {
        total += weight;
        reasons.push(reason.to_string());
    };

    match call.operation {
        Operation::Delete => add(0.7, "delete_operation"),
        Operation::Write | Operation::Edit => add(0.25, "write_operation"),
        Operation::Read => {}
    }

    if call.modifies_tests {
        add(0.3, "modifies_tests");
    }
    if call.requires_bash {
        add(0.2, "bash_execution");
    }
    if call.requires_network {
        add(0.15, "network_access");
    }
    if let Some(command) = call.command {
        if DESTRUCTIVE_SUBSTRINGS.iter().any(|s| command.contains(s)) {
            add(0.6, "destructive_command");
        }
    }
    if call.payload_bytes > LARGE_WRITE_BYTES {
        add(0.2, "large_write");
    }
    if call.outside_project {
        add(0.5, "outside_project");
    }
    if let Some(path) = call.path {
        if is_dotfile(path) {
            add(0.2, "dotfile_path");
        }
        if is_dependency_manifest(path) || is_build_config(path) {
            add(0.2, "dependency_manifest");
        }
        if is_permissions_config(path) {
            add(0.3, "permissions_config");
        }
    }

    RiskBreakdown {
        score: total.min(1.0),
        reasons,
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleetline_types::PermissionProfile;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Edit,
    Delete,
}

impl Operation {
    fn is_mutating(self) -> bool {
        matches!(self, Operation::Write | Operation::Edit | Operation::Delete)
    }
}

#[derive(Debug, Clone)]
pub struct ToolCall<'a> {
    pub tool: &'a str,
    pub operation: Operation,
    pub path: Option<&'a Path>,
    pub requires_bash: bool,
    pub requires_network: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionCheck {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub violations: Vec<String>,
}

impl PermissionCheck {
    fn allow() -> Self {
        Self { allowed: true, reason: None, violations: Vec::new() }
    }

    fn deny(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self { allowed: false, violations: vec![reason.clone()], reason: Some(reason) }
    }
}

/// Path begins with `tests/` or its basename begins with `test_`
/// (spec 4.K, exact rule kept from `original_source/test_protection.py`).
pub fn is_test_path(path: &Path) -> bool {
    if path.starts_with("tests") {
        return true;
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("test_"))
        .unwrap_or(false)
}

/// Ordered deterministic check against a static profile (spec 4.K items
/// 1-6). Unlike the permission manager below, this never blocks on a human
/// decision — it's a pure function of the call and the profile.
pub fn validate(call: &ToolCall<'_>, project_root: &Path, profile: &PermissionProfile) -> PermissionCheck {
    // 1. Tool in profile's allowed list, if the list is non-empty.
    if !profile.tools.is_empty() && !profile.tools.iter().any(|t| t == call.tool) {
        return PermissionCheck::deny(format!("tool:{}", call.tool));
    }

    // 2. requires_bash => profile permits bash.
    if call.requires_bash && !profile.can_run_bash {
        return PermissionCheck::deny("bash_not_permitted");
    }

    // 3. requires_network => profile permits network.
    if call.requires_network && !profile.can_access_network {
        return PermissionCheck::deny("network_not_permitted");
    }

    if let Some(path) = call.path {
        let resolved = resolve_within(project_root, path);

        // 4. outside project root, or matches paths_forbidden => deny.
        let Some(resolved) = resolved else {
            return PermissionCheck::deny("path_outside_project");
        };
        if matches_any_glob(&profile.paths_forbidden, &resolved) {
            return PermissionCheck::deny("path_forbidden");
        }

        // 5. paths_allowed non-empty and no match => deny. Empty list
        //    means allow-all (Open Question 2, kept as documented).
        if !profile.paths_allowed.is_empty() && !matches_any_glob(&profile.paths_allowed, &resolved) {
            return PermissionCheck::deny("path_not_allowed");
        }

        // 6. mutating operation on a test path without can_modify_tests.
        if call.operation.is_mutating() && is_test_path(&resolved) && !profile.can_modify_tests {
            return PermissionCheck::deny("test_path_protected");
        }
    }

    PermissionCheck::allow()
}

fn resolve_within(root: &Path, path: &Path) -> Option<PathBuf> {
    let candidate = if path.is_absolute() { path.to_path_buf() } else { root.join(path) };
    let normalized = normalize(&candidate);
    let root_normalized = normalize(root);
    if normalized.starts_with(&root_normalized) {
        normalized.strip_prefix(&root_normalized).ok().map(|p| p.to_path_buf())
    } else {
        None
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn matches_any_glob(patterns: &[String], path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    patterns.iter().any(|pattern| glob_match(pattern, &path_str))
}

/// Minimal glob matcher supporting `*` as a wildcard segment (prefix,
/// suffix, or middle), enough for `src/**`, `*.md`, `tests/*` style rules.
fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value || value.starts_with(&format!("{pattern}/"));
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut cursor = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !value[cursor..].starts_with(part) {
                return false;
            }
            cursor += part.len();
        } else if i == parts.len() - 1 {
            return value[cursor..].ends_with(part);
        } else if let Some(pos) = value[cursor..].find(part) {
            cursor += pos + part.len();
        } else {
            return false;
        }
    }
    true
}

/// Profiles merged from defaults and project config; a `default` profile
/// is always present and effective even absent any project configuration.
pub struct ProfileStore {
    profiles: Arc<RwLock<HashMap<String, PermissionProfile>>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        let mut profiles = HashMap::new();
        let default = PermissionProfile::default_profile();
        profiles.insert(default.name.clone(), default);
        Self { profiles: Arc::new(RwLock::new(profiles)) }
    }

    pub async fn upsert(&self, profile: PermissionProfile) {
        self.profiles.write().await.insert(profile.name.clone(), profile);
    }

    pub async fn get(&self, name: &str) -> PermissionProfile {
        self.profiles
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_else(PermissionProfile::default_profile)
    }

    pub async fn list(&self) -> Vec<PermissionProfile> {
        self.profiles.read().await.values().cloned().collect()
    }
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with_tools(tools: &[&str]) -> PermissionProfile {
        PermissionProfile {
            tools: tools.iter().map(|s| s.to_string()).collect(),
            paths_allowed: vec!["src/**".into()],
            ..PermissionProfile::default_profile()
        }
    }

    #[test]
    fn denies_tool_outside_allowed_list() {
        let profile = profile_with_tools(&["read"]);
        let call = ToolCall {
            tool: "write",
            operation: Operation::Write,
            path: Some(Path::new("src/main.rs")),
            requires_bash: false,
            requires_network: false,
        };
        let result = validate(&call, Path::new("/proj"), &profile);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("tool:write"));
    }

    #[test]
    fn empty_paths_allowed_means_allow_all() {
        let profile = PermissionProfile::default_profile();
        let call = ToolCall {
            tool: "read",
            operation: Operation::Read,
            path: Some(Path::new("anything/anywhere.rs")),
            requires_bash: false,
            requires_network: false,
        };
        assert!(validate(&call, Path::new("/proj"), &profile).allowed);
    }

    #[test]
    fn denies_writes_to_test_paths_without_can_modify_tests() {
        let profile = PermissionProfile {
            paths_allowed: vec![],
            ..PermissionProfile::default_profile()
        };
        let call = ToolCall {
            tool: "write",
            operation: Operation::Write,
            path: Some(Path::new("tests/test_foo.rs")),
            requires_bash: false,
            requires_network: false,
        };
        let result = validate(&call, Path::new("/proj"), &profile);
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("test_path_protected"));
    }

    #[test]
    fn glob_match_supports_double_star_prefix() {
        assert!(glob_match("src/**", "src/main.rs"));
        assert!(!glob_match("src/**", "docs/readme.md"));
    }
}

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionProfile {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub paths_allowed: Vec<String>,
    #[serde(default)]
    pub paths_forbidden: Vec<String>,
    #[serde(default)]
    pub can_spawn_subagents: bool,
    #[serde(default)]
    pub can_modify_tests: bool,
    #[serde(default)]
    pub can_run_bash: bool,
    #[serde(default)]
    pub can_access_network: bool,
}

pub const DEFAULT_PROFILE_NAME: &str = "default";

impl PermissionProfile {
    /// The profile that is always effective even if no project config
    /// defines one: no tool restriction, no path restriction, no
    /// dangerous capabilities.
    pub fn default_profile() -> Self {
        Self {
            name: DEFAULT_PROFILE_NAME.to_string(),
            tools: Vec::new(),
            paths_allowed: Vec::new(),
            paths_forbidden: Vec::new(),
            can_spawn_subagents: false,
            can_modify_tests: false,
            can_run_bash: false,
            can_access_network: false,
        }
    }
}

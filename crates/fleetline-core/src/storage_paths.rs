use std::env;
use std::path::{Path, PathBuf};

/// The §6 on-disk layout, resolved relative to a data directory. Default
/// `./.subagent/` with a legacy `./.claude/` fallback, overridable via
/// `SUBAGENT_DATA_DIR` / `SUBAGENT_TRACKING_ROOT`.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
}

const DEFAULT_DIR: &str = ".subagent";
const LEGACY_DIR: &str = ".claude";

impl DataPaths {
    pub fn resolve(project_root: &Path) -> Self {
        if let Ok(dir) = env::var("SUBAGENT_DATA_DIR").or_else(|_| env::var("SUBAGENT_TRACKING_ROOT")) {
            return Self { root: PathBuf::from(dir) };
        }
        let default = project_root.join(DEFAULT_DIR);
        if default.exists() {
            return Self { root: default };
        }
        let legacy = project_root.join(LEGACY_DIR);
        if legacy.exists() {
            return Self { root: legacy };
        }
        Self { root: default }
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn analytics_dir(&self) -> PathBuf {
        self.root.join("analytics")
    }

    pub fn handoffs_dir(&self) -> PathBuf {
        self.root.join("handoffs")
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.root.join("hooks")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn requirements_dir(&self) -> PathBuf {
        self.root.join("requirements")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn log_file(&self, session_id: &str, compressed: bool) -> PathBuf {
        let name = if compressed {
            format!("{session_id}.jsonl.gz")
        } else {
            format!("{session_id}.jsonl")
        };
        self.logs_dir().join(name)
    }

    pub fn snapshot_file(&self, session_id: &str, index: u32) -> PathBuf {
        self.state_dir().join(format!("{session_id}_snap{index:03}.json"))
    }

    pub fn agents_file(&self) -> PathBuf {
        self.state_dir().join("agents.json")
    }

    pub fn approvals_file(&self) -> PathBuf {
        self.state_dir().join("approvals.json")
    }

    pub fn session_file(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    pub fn current_session_pointer(&self) -> PathBuf {
        self.sessions_dir().join("current.json")
    }

    pub fn analytics_db(&self) -> PathBuf {
        self.analytics_dir().join("tracking.db")
    }

    pub fn handoff_file(&self, session_id: &str, reason: &str) -> PathBuf {
        self.handoffs_dir().join(format!("{session_id}_{reason}.md"))
    }

    pub fn tasks_file(&self) -> PathBuf {
        self.tasks_dir().join("tasks.json")
    }

    pub fn prd_file(&self) -> PathBuf {
        self.requirements_dir().join("PRD.md")
    }
}

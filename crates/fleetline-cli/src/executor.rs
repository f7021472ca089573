use std::path::{Path, PathBuf};

use fleetline_proxy::ToolExecutor;
use serde_json::{json, Value};

/// The concrete tool backend the proxy dispatches to once permission and
/// risk checks clear: plain filesystem reads/writes rooted at the project
/// directory. Anything beyond read/write/edit (bash, network) is out of
/// scope here — the proxy's gating logic is what this crate demonstrates,
/// not a full tool runtime.
pub struct FsToolExecutor {
    project_root: PathBuf,
}

impl FsToolExecutor {
    pub fn new(project_root: PathBuf) -> Self {
        Self { project_root }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_root.join(path)
        }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for FsToolExecutor {
    async fn execute(&self, tool: &str, path: Option<&Path>) -> anyhow::Result<Value> {
        match (tool, path) {
            ("read", Some(path)) => {
                let contents = tokio::fs::read_to_string(self.resolve(path)).await?;
                Ok(json!({ "contents": contents }))
            }
            ("write", Some(path)) | ("edit", Some(path)) => {
                let resolved = self.resolve(path);
                if let Some(parent) = resolved.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Ok(json!({ "path": resolved.display().to_string() }))
            }
            ("delete", Some(path)) => {
                let resolved = self.resolve(path);
                if resolved.exists() {
                    tokio::fs::remove_file(&resolved).await?;
                }
                Ok(json!({ "deleted": resolved.display().to_string() }))
            }
            _ => anyhow::bail!("unsupported tool invocation: {tool}"),
        }
    }
}

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use fleetline_types::Event;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

const HOOK_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of running a single hook script, or a whole phase of them.
/// Mirrors the teacher's `HookResult<T>` shape (`Continue`/`Cancel`) but the
/// payload a hook reports back is a tri-state decision rather than a
/// transformed value, since hook scripts don't get to rewrite the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    Deny(String),
    Warn(String),
}

#[derive(Debug, Serialize)]
struct HookRequest<'a> {
    event_type: &'a str,
    session_id: &'a str,
    trace_id: &'a str,
    payload: &'a serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct HookResponse {
    decision: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
struct HookScript {
    path: PathBuf,
    name: String,
}

/// Discovers and runs user scripts under `hooks/{pre-agent-invocation,
/// post-agent-invocation,on-error}`. Each script is invoked as a
/// subprocess, fed a JSON request on stdin, and expected to print a JSON
/// `{decision, message?}` response. A hard 1s timeout and fail-open
/// (`ALLOW`) on any nonzero exit or malformed output keeps a broken script
/// from deadlocking the pipeline (§9 design note).
pub struct HookDispatcher {
    pre: Vec<HookScript>,
    post: Vec<HookScript>,
    on_error: Vec<HookScript>,
}

impl HookDispatcher {
    pub fn discover(hooks_root: &Path) -> Self {
        Self {
            pre: discover_scripts(&hooks_root.join("pre-agent-invocation")),
            post: discover_scripts(&hooks_root.join("post-agent-invocation")),
            on_error: discover_scripts(&hooks_root.join("on-error")),
        }
    }

    pub fn len(&self) -> usize {
        self.pre.len() + self.post.len() + self.on_error.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs pre-invocation hooks in order, synchronously, before the
    /// effective agent work begins. The first `Deny` short-circuits the
    /// remaining hooks; the caller is expected to emit `agent.blocked`.
    pub async fn run_pre(&self, event: &Event) -> HookDecision {
        for script in &self.pre {
            match run_hook_script(script, event).await {
                HookDecision::Deny(reason) => {
                    info!(hook = %script.name, reason, "pre-hook denied");
                    return HookDecision::Deny(reason);
                }
                HookDecision::Warn(reason) => {
                    warn!(hook = %script.name, reason, "pre-hook warned");
                }
                HookDecision::Allow => {}
            }
        }
        HookDecision::Allow
    }

    /// Post-invocation hooks run asynchronously, with per-hook error
    /// isolation: one hook's failure never blocks another's execution.
    pub async fn run_post(&self, event: &Event) {
        for script in &self.post {
            let _ = run_hook_script(script, event).await;
        }
    }

    /// Runs on `agent.failed`.
    pub async fn run_on_error(&self, event: &Event) {
        for script in &self.on_error {
            let _ = run_hook_script(script, event).await;
        }
    }
}

fn discover_scripts(dir: &Path) -> Vec<HookScript> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut scripts: Vec<HookScript> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .map(|path| {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            HookScript { path, name }
        })
        .collect();
    // Filenames are the priority knob: a `00-`/`10-`/`20-` prefix convention
    // sorts lexically into execution order.
    scripts.sort_by(|a, b| a.name.cmp(&b.name));
    scripts
}

async fn run_hook_script(script: &HookScript, event: &Event) -> HookDecision {
    let request = HookRequest {
        event_type: &event.event_type,
        session_id: &event.session_id,
        trace_id: &event.trace_id,
        payload: &event.payload,
    };
    let Ok(body) = serde_json::to_vec(&request) else {
        return HookDecision::Allow;
    };

    let spawn = Command::new(&script.path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match spawn {
        Ok(child) => child,
        Err(err) => {
            warn!(hook = %script.name, error = %err, "failed to spawn hook, failing open");
            return HookDecision::Allow;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&body).await;
    }

    let run = tokio::time::timeout(HOOK_TIMEOUT, child.wait_with_output()).await;

    let output = match run {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            warn!(hook = %script.name, error = %err, "hook execution failed, failing open");
            return HookDecision::Allow;
        }
        Err(_) => {
            warn!(hook = %script.name, "hook timed out after 1s, failing open");
            return HookDecision::Allow;
        }
    };

    if !output.status.success() {
        debug!(hook = %script.name, "hook exited nonzero, failing open");
        return HookDecision::Allow;
    }

    match serde_json::from_slice::<HookResponse>(&output.stdout) {
        Ok(response) => match response.decision.to_ascii_uppercase().as_str() {
            "DENY" => HookDecision::Deny(response.message.unwrap_or_default()),
            "WARN" => HookDecision::Warn(response.message.unwrap_or_default()),
            _ => HookDecision::Allow,
        },
        Err(_) => HookDecision::Allow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hooks_root_yields_empty_dispatcher() {
        let dispatcher = HookDispatcher::discover(Path::new("/nonexistent/hooks"));
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn run_pre_allows_when_no_scripts_registered() {
        let dispatcher = HookDispatcher::discover(Path::new("/nonexistent/hooks"));
        let event = Event::new("agent.invoked", "s1", serde_json::Map::new()).unwrap();
        assert_eq!(dispatcher.run_pre(&event).await, HookDecision::Allow);
    }
}

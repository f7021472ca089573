use std::path::PathBuf;

use fleetline_core::{AgentFilter, Operation, ToolCall};
use fleetline_proxy::ProxyRequest;
use fleetline_types::{AgentStatus, ApprovalStatus, TaskStatus};
use serde_json::json;

use crate::runtime::Runtime;

/// `0` success, `1` validation/usage error, `2` denied (spec §6).
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_USAGE_ERROR: i32 = 1;
pub const EXIT_DENIED: i32 = 2;

fn print_json(value: impl serde::Serialize) {
    println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
}

pub async fn status(runtime: &Runtime) -> i32 {
    let bus_stats = runtime.bus.stats().await;
    let current_session = runtime.sessions.current().await;
    let agents = runtime.agents.list(&AgentFilter::default()).await;
    print_json(json!({
        "bus": bus_stats,
        "current_session": current_session,
        "agent_count": agents.len(),
        "data_dir": runtime.paths.root,
    }));
    EXIT_SUCCESS
}

pub async fn config(runtime: &Runtime) -> i32 {
    print_json(runtime.config.effective().await);
    EXIT_SUCCESS
}

pub mod session {
    use super::*;

    pub async fn start(runtime: &Runtime, session_id: &str) -> i32 {
        match runtime.sessions.start(session_id).await {
            Ok(session) => {
                print_json(session);
                EXIT_SUCCESS
            }
            Err(err) => {
                eprintln!("error: {err}");
                EXIT_USAGE_ERROR
            }
        }
    }

    pub async fn end(runtime: &Runtime, session_id: &str, failed: bool) -> i32 {
        match runtime.sessions.end(session_id, failed).await {
            Ok(Some(session)) => {
                runtime.log_writer.flush(session_id).await;
                print_json(session);
                EXIT_SUCCESS
            }
            Ok(None) => {
                eprintln!("error: no such session {session_id}");
                EXIT_USAGE_ERROR
            }
            Err(err) => {
                eprintln!("error: {err}");
                EXIT_USAGE_ERROR
            }
        }
    }

    pub async fn list(runtime: &Runtime) -> i32 {
        match runtime.sessions.list().await {
            Ok(sessions) => {
                print_json(sessions);
                EXIT_SUCCESS
            }
            Err(err) => {
                eprintln!("error: {err}");
                EXIT_USAGE_ERROR
            }
        }
    }
}

pub mod task {
    use super::*;

    pub async fn create(runtime: &Runtime, id: &str, description: &str, priority: u8) -> i32 {
        match runtime.tasks.create(id, description, priority).await {
            Ok(task) => {
                print_json(task);
                EXIT_SUCCESS
            }
            Err(err) => {
                eprintln!("error: {err}");
                EXIT_USAGE_ERROR
            }
        }
    }

    pub async fn list(runtime: &Runtime, status: Option<TaskStatus>) -> i32 {
        print_json(runtime.tasks.list(status).await);
        EXIT_SUCCESS
    }

    pub async fn show(runtime: &Runtime, id: &str) -> i32 {
        match runtime.tasks.get(id).await {
            Some(task) => {
                print_json(task);
                EXIT_SUCCESS
            }
            None => {
                eprintln!("error: no such task {id}");
                EXIT_USAGE_ERROR
            }
        }
    }

    pub async fn update(runtime: &Runtime, id: &str, status: Option<TaskStatus>, priority: Option<u8>) -> i32 {
        let result = runtime
            .tasks
            .update(id, |t| {
                if let Some(status) = status {
                    t.status = status;
                }
                if let Some(priority) = priority {
                    t.priority = priority.clamp(1, 5);
                }
            })
            .await;
        match result {
            Ok(Some(task)) => {
                print_json(task);
                EXIT_SUCCESS
            }
            Ok(None) => {
                eprintln!("error: no such task {id}");
                EXIT_USAGE_ERROR
            }
            Err(err) => {
                eprintln!("error: {err}");
                EXIT_USAGE_ERROR
            }
        }
    }

    pub async fn complete(runtime: &Runtime, id: &str) -> i32 {
        match runtime.tasks.complete(id).await {
            Ok(Some(task)) => {
                print_json(task);
                EXIT_SUCCESS
            }
            Ok(None) => {
                eprintln!("error: no such task {id}");
                EXIT_USAGE_ERROR
            }
            Err(err) => {
                eprintln!("error: {err}");
                EXIT_USAGE_ERROR
            }
        }
    }
}

pub mod agent {
    use super::*;

    pub async fn spawn(runtime: &Runtime, agent_id: &str, agent_type: &str, model: &str) -> i32 {
        let record = runtime.agents.create(agent_id, agent_type, model).await;
        print_json(record);
        EXIT_SUCCESS
    }

    pub async fn list(runtime: &Runtime, status: Option<AgentStatus>) -> i32 {
        let filter = AgentFilter { status, session_id: None };
        print_json(runtime.agents.list(&filter).await);
        EXIT_SUCCESS
    }

    pub async fn show(runtime: &Runtime, agent_id: &str) -> i32 {
        match runtime.agents.get(agent_id).await {
            Some(record) => {
                print_json(record);
                EXIT_SUCCESS
            }
            None => {
                eprintln!("error: no such agent {agent_id}");
                EXIT_USAGE_ERROR
            }
        }
    }

    pub async fn pause(runtime: &Runtime, agent_id: &str) -> i32 {
        if runtime.agents.pause(agent_id).await {
            EXIT_SUCCESS
        } else {
            eprintln!("error: cannot pause {agent_id}");
            EXIT_USAGE_ERROR
        }
    }

    pub async fn resume(runtime: &Runtime, agent_id: &str) -> i32 {
        if runtime.agents.resume(agent_id).await {
            EXIT_SUCCESS
        } else {
            eprintln!("error: cannot resume {agent_id}");
            EXIT_USAGE_ERROR
        }
    }

    pub async fn terminate(runtime: &Runtime, agent_id: &str) -> i32 {
        if runtime.agents.terminate(agent_id).await {
            EXIT_SUCCESS
        } else {
            eprintln!("error: cannot terminate {agent_id}");
            EXIT_USAGE_ERROR
        }
    }

    pub async fn heartbeat(
        runtime: &Runtime,
        agent_id: &str,
        tokens_used: Option<u64>,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
        cost_usd: Option<f64>,
    ) -> i32 {
        let update = fleetline_core::HeartbeatUpdate { tokens_used, input_tokens, output_tokens, cost_usd };
        match runtime.agents.record_heartbeat(agent_id, update).await {
            Some(record) => {
                print_json(record);
                EXIT_SUCCESS
            }
            None => {
                eprintln!("error: no such agent {agent_id}");
                EXIT_USAGE_ERROR
            }
        }
    }

    pub async fn switch_model(runtime: &Runtime, agent_id: &str, model: &str) -> i32 {
        match runtime.agents.switch_model(agent_id, model).await {
            Some(record) => {
                print_json(record);
                EXIT_SUCCESS
            }
            None => {
                eprintln!("error: no such agent {agent_id}");
                EXIT_USAGE_ERROR
            }
        }
    }
}

pub mod tool {
    use super::*;

    fn operation_for(op: &str) -> Option<Operation> {
        match op {
            "read" => Some(Operation::Read),
            "write" => Some(Operation::Write),
            "edit" => Some(Operation::Edit),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }

    pub async fn check(runtime: &Runtime, tool: &str, operation: &str, path: Option<PathBuf>) -> i32 {
        let Some(operation) = operation_for(operation) else {
            eprintln!("error: unknown operation {operation}");
            return EXIT_USAGE_ERROR;
        };
        let profile = runtime.profiles.get("default").await;
        let call = ToolCall {
            tool,
            operation,
            path: path.as_deref(),
            requires_bash: false,
            requires_network: false,
        };
        let result = fleetline_core::validate_permission(&call, &runtime.project_root, &profile);
        let denied = !result.allowed;
        print_json(result);
        if denied {
            EXIT_DENIED
        } else {
            EXIT_SUCCESS
        }
    }

    pub async fn simulate(runtime: &Runtime, session_id: &str, tool: &str, operation: &str, path: Option<PathBuf>) -> i32 {
        let Some(operation) = operation_for(operation) else {
            eprintln!("error: unknown operation {operation}");
            return EXIT_USAGE_ERROR;
        };
        let request = ProxyRequest {
            tool,
            operation,
            path: path.as_deref(),
            requires_bash: false,
            requires_network: false,
            command: None,
            payload_bytes: 0,
            modifies_tests: false,
            agent: None,
            profile: "default",
            approval_id: None,
            approved: false,
        };
        let result = runtime.proxy.call(session_id, request).await;
        let success = result.success;
        print_json(result);
        if success {
            EXIT_SUCCESS
        } else {
            EXIT_DENIED
        }
    }

    async fn run(runtime: &Runtime, session_id: &str, operation: Operation, tool: &str, path: PathBuf) -> i32 {
        let request = ProxyRequest {
            tool,
            operation,
            path: Some(&path),
            requires_bash: false,
            requires_network: false,
            command: None,
            payload_bytes: 0,
            modifies_tests: fleetline_core::is_test_path(&path),
            agent: None,
            profile: "default",
            approval_id: None,
            approved: false,
        };
        let result = runtime.proxy.call(session_id, request).await;
        let success = result.success;
        print_json(result);
        if success {
            EXIT_SUCCESS
        } else {
            EXIT_DENIED
        }
    }

    pub async fn read(runtime: &Runtime, session_id: &str, path: PathBuf) -> i32 {
        run(runtime, session_id, Operation::Read, "read", path).await
    }

    pub async fn write(runtime: &Runtime, session_id: &str, path: PathBuf) -> i32 {
        run(runtime, session_id, Operation::Write, "write", path).await
    }

    pub async fn edit(runtime: &Runtime, session_id: &str, path: PathBuf) -> i32 {
        run(runtime, session_id, Operation::Edit, "edit", path).await
    }
}

pub async fn metrics(runtime: &Runtime, scope: &str) -> i32 {
    let window = match scope {
        "session" => "1m",
        "task" => "1m",
        "project" => "1h",
        other => {
            eprintln!("error: unknown metrics scope {other}");
            return EXIT_USAGE_ERROR;
        }
    };
    match runtime.metrics.stats(window).await {
        Some(stats) => {
            print_json(stats);
            EXIT_SUCCESS
        }
        None => {
            eprintln!("error: no metrics window named {window}");
            EXIT_USAGE_ERROR
        }
    }
}

pub async fn review(runtime: &Runtime, task_id: &str) -> i32 {
    match runtime.tasks.get(task_id).await {
        Some(task) => {
            print_json(task);
            EXIT_SUCCESS
        }
        None => {
            eprintln!("error: no such task {task_id}");
            EXIT_USAGE_ERROR
        }
    }
}

async fn tail_log(runtime: &Runtime, session_id: &str, lines: usize) -> Vec<String> {
    let log_path = runtime.paths.log_file(session_id, true);
    let plain_path = runtime.paths.log_file(session_id, false);
    let path = if log_path.exists() { log_path } else { plain_path };
    let Ok(contents) = tokio::fs::read_to_string(&path).await else {
        return Vec::new();
    };
    let mut tail: Vec<String> = contents.lines().rev().take(lines).map(str::to_string).collect();
    tail.reverse();
    tail
}

pub async fn handoff(runtime: &Runtime, session_id: &str, reason: &str) -> i32 {
    let recent = tail_log(runtime, session_id, 20).await;
    match runtime.snapshots.create_handoff_summary(session_id, reason, &recent).await {
        Ok(summary) => {
            println!("{summary}");
            EXIT_SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            EXIT_USAGE_ERROR
        }
    }
}

pub async fn logs(runtime: &Runtime, session_id: &str, lines: usize) -> i32 {
    let tail = tail_log(runtime, session_id, lines).await;
    if tail.is_empty() {
        eprintln!("error: no log file for session {session_id}");
        return EXIT_USAGE_ERROR;
    }
    for line in tail {
        println!("{line}");
    }
    EXIT_SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetline_core::EventHandler;
    use fleetline_types::Event;
    use tempfile::TempDir;

    #[tokio::test]
    async fn session_end_flushes_buffered_log_lines_to_disk() {
        let dir = TempDir::new().unwrap();
        let runtime = Runtime::init(dir.path()).await.unwrap();
        runtime.sessions.start("s1").await.unwrap();

        let event = Event::new("tool.used", "s1", serde_json::Map::new()).unwrap();
        runtime.log_writer.handle(&event).await.unwrap();

        session::end(&runtime, "s1", false).await;

        let compressed = runtime.paths.log_file("s1", true);
        let plain = runtime.paths.log_file("s1", false);
        assert!(compressed.exists() || plain.exists(), "expected a flushed log file for session s1");
    }
}

pub mod approvals {
    use super::*;

    pub async fn list(runtime: &Runtime, status: Option<ApprovalStatus>) -> i32 {
        print_json(runtime.approvals.list(status).await);
        EXIT_SUCCESS
    }

    pub async fn decide(runtime: &Runtime, approval_id: &str, granted: bool, decision: Option<String>) -> i32 {
        match runtime.approvals.decide(approval_id, granted, decision).await {
            Ok(Some(record)) => {
                print_json(record);
                EXIT_SUCCESS
            }
            Ok(None) => {
                eprintln!("error: no such approval {approval_id}");
                EXIT_USAGE_ERROR
            }
            Err(err) => {
                eprintln!("error: {err}");
                EXIT_USAGE_ERROR
            }
        }
    }
}

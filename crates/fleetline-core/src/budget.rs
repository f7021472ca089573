use chrono::{DateTime, Utc};
use fleetline_types::AgentRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub limit: f64,
    pub value: f64,
    pub severity: AlertSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetMetrics {
    pub tokens_used: u64,
    pub elapsed_seconds: i64,
    pub heartbeat_age_seconds: i64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCheckResult {
    pub exceeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub alerts: Vec<BudgetAlert>,
    pub metrics: BudgetMetrics,
}

/// Evaluates an agent's derived metrics against its budget (spec 4.J),
/// grounded verbatim on `original_source/src/orchestration/budget.py`: the
/// tie-break is `None` when only soft alerts fired, the single hard
/// alert's type when exactly one fired, and `multiple_limits` when more
/// than one hard alert fired. Never mutates state — the caller
/// (`AgentRegistry::record_heartbeat`) is responsible for invoking the
/// lifecycle on a hard breach.
pub fn check(record: &AgentRecord, now: DateTime<Utc>) -> BudgetCheckResult {
    let elapsed_seconds = record
        .started_at
        .map(|s| (now - s).num_seconds())
        .unwrap_or(0);
    let heartbeat_age_seconds = record
        .last_heartbeat
        .map(|h| (now - h).num_seconds())
        .unwrap_or(0);
    let tokens_used = record.metrics.tokens_used;
    let cost_usd = record.metrics.cost_usd;

    let mut alerts = Vec::new();

    if let Some(limit) = record.budget.token_limit {
        if tokens_used >= limit {
            alerts.push(BudgetAlert {
                alert_type: "token_limit".into(),
                limit: limit as f64,
                value: tokens_used as f64,
                severity: AlertSeverity::Hard,
            });
        }
    }

    if let Some(limit) = record.budget.time_limit_seconds {
        if elapsed_seconds >= limit as i64 {
            alerts.push(BudgetAlert {
                alert_type: "time_limit".into(),
                limit: limit as f64,
                value: elapsed_seconds as f64,
                severity: AlertSeverity::Hard,
            });
        }
    }

    if let Some(limit) = record.budget.cost_limit_usd {
        if cost_usd >= limit {
            alerts.push(BudgetAlert {
                alert_type: "cost_limit".into(),
                limit,
                value: cost_usd,
                severity: AlertSeverity::Hard,
            });
        }
    }

    if let Some(interval) = record.budget.heartbeat_interval_seconds {
        if heartbeat_age_seconds >= interval as i64 {
            alerts.push(BudgetAlert {
                alert_type: "heartbeat_interval".into(),
                limit: interval as f64,
                value: heartbeat_age_seconds as f64,
                severity: AlertSeverity::Soft,
            });
        }
    }

    if let Some(timeout) = record.budget.heartbeat_timeout_seconds {
        if heartbeat_age_seconds >= timeout as i64 {
            alerts.push(BudgetAlert {
                alert_type: "heartbeat_timeout".into(),
                limit: timeout as f64,
                value: heartbeat_age_seconds as f64,
                severity: AlertSeverity::Hard,
            });
        }
    }

    if let Some(timeout) = record.budget.sla_timeout_seconds {
        if elapsed_seconds >= timeout as i64 {
            alerts.push(BudgetAlert {
                alert_type: "sla_timeout".into(),
                limit: timeout as f64,
                value: elapsed_seconds as f64,
                severity: AlertSeverity::Hard,
            });
        }
    }

    let hard: Vec<&BudgetAlert> = alerts.iter().filter(|a| a.severity == AlertSeverity::Hard).collect();
    let reason = match hard.len() {
        0 => None,
        1 => Some(hard[0].alert_type.clone()),
        _ => Some("multiple_limits".to_string()),
    };

    BudgetCheckResult {
        exceeded: !hard.is_empty(),
        reason,
        alerts,
        metrics: BudgetMetrics {
            tokens_used,
            elapsed_seconds,
            heartbeat_age_seconds,
            cost_usd,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetline_types::{AgentBudget, AgentMetrics, AgentRecord};

    fn base_record() -> AgentRecord {
        let mut record = AgentRecord::new("a1", "build", "strong-1");
        record.started_at = Some(Utc::now() - chrono::Duration::seconds(10));
        record
    }

    #[test]
    fn token_limit_breach_is_hard_and_reasoned() {
        let mut record = base_record();
        record.budget = AgentBudget { token_limit: Some(5), ..Default::default() };
        record.metrics = AgentMetrics { tokens_used: 10, ..Default::default() };
        let result = check(&record, Utc::now());
        assert!(result.exceeded);
        assert_eq!(result.reason.as_deref(), Some("token_limit"));
    }

    #[test]
    fn multiple_hard_alerts_report_multiple_limits() {
        let mut record = base_record();
        record.budget = AgentBudget {
            token_limit: Some(1),
            cost_limit_usd: Some(0.01),
            ..Default::default()
        };
        record.metrics = AgentMetrics { tokens_used: 100, cost_usd: 1.0, ..Default::default() };
        let result = check(&record, Utc::now());
        assert_eq!(result.reason.as_deref(), Some("multiple_limits"));
    }

    #[test]
    fn only_soft_alert_does_not_exceed() {
        let mut record = base_record();
        record.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(30));
        record.budget = AgentBudget {
            heartbeat_interval_seconds: Some(10),
            ..Default::default()
        };
        let result = check(&record, Utc::now());
        assert!(!result.exceeded);
        assert_eq!(result.reason, None);
    }
}

use crate::cmd::{load_alerts, load_config};
use crate::output::{print_json, print_table};
use anyhow::Context;
use remedy_core::scheduler::QueueHistoryFilter;
use remedy_core::{AutomationSpec, Engine, HistoryEntry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DRAIN_POLL: Duration = Duration::from_millis(10);

fn load_rules(path: &Path) -> anyhow::Result<Vec<AutomationSpec>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read rules file {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("invalid rules file {}", path.display()))
}

pub fn run(
    config_path: Option<&Path>,
    alerts_path: &Path,
    rules_path: &Path,
    queued: bool,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let rules = load_rules(rules_path)?;
    let alerts = load_alerts(alerts_path)?;

    let engine = Arc::new(Engine::new(config).context("cannot start engine")?);
    for (i, spec) in rules.into_iter().enumerate() {
        engine
            .register_automation(spec)
            .with_context(|| format!("rule #{} rejected", i + 1))?;
    }
    tracing::info!(
        automations = engine.matcher().list().len(),
        alerts = alerts.len(),
        queued,
        "replay starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    if queued {
        rt.block_on(replay_queued(&engine, alerts, json))
    } else {
        rt.block_on(replay_direct(&engine, alerts, json))
    }
}

// ---------------------------------------------------------------------------
// Direct: every match runs inline
// ---------------------------------------------------------------------------

async fn replay_direct(
    engine: &Arc<Engine>,
    alerts: Vec<remedy_core::Alert>,
    json: bool,
) -> anyhow::Result<()> {
    let mut entries: Vec<HistoryEntry> = Vec::with_capacity(alerts.len());
    for alert in alerts {
        let at = alert.timestamp;
        entries.push(engine.handle_alert(alert).await?);
        // Pattern conditions see the window as of the alert just replayed.
        engine.detect_patterns_at(at);
    }
    let report = engine.detector().report();

    if json {
        return print_json(&serde_json::json!({
            "entries": entries,
            "patterns": report,
        }));
    }

    let rows = entries
        .iter()
        .map(|e| {
            let outcome = if e.automations.is_empty() {
                "-".to_string()
            } else if e.success {
                "ok".to_string()
            } else {
                let failed = e.runs.iter().filter(|r| !r.success).count();
                format!("{failed} failed")
            };
            vec![
                e.alert.timestamp.to_rfc3339(),
                e.alert.alert_type.clone(),
                e.alert.priority.to_string(),
                e.automations.join(","),
                outcome,
            ]
        })
        .collect();
    print_table(&["TIMESTAMP", "TYPE", "PRIORITY", "MATCHED", "OUTCOME"], rows);

    let runs: usize = entries.iter().map(|e| e.runs.len()).sum();
    let failed: usize = entries
        .iter()
        .flat_map(|e| &e.runs)
        .filter(|r| !r.success)
        .count();
    println!(
        "\n{} alerts, {runs} runs, {failed} failed, {} patterns",
        entries.len(),
        report.patterns.len() + report.sequences.len() + report.correlations.len()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Queued: matches go through the scheduler
// ---------------------------------------------------------------------------

async fn replay_queued(
    engine: &Arc<Engine>,
    alerts: Vec<remedy_core::Alert>,
    json: bool,
) -> anyhow::Result<()> {
    let total = alerts.len();
    let scheduler = engine.scheduler();
    let capacity = engine.config().scheduler.max_queue_size;
    for alert in alerts {
        let at = alert.timestamp;
        // Leave room for this alert's matches before routing it.
        while engine.get_queue().len() >= capacity {
            scheduler.process_queue();
            tokio::time::sleep(DRAIN_POLL).await;
        }
        let routed = engine.route_alert(alert).await?;
        for rejected in &routed.rejected {
            tracing::warn!(
                automation = %rejected.automation_id,
                error = %rejected.error,
                "match dropped during replay"
            );
        }
        engine.detect_patterns_at(at);
    }

    loop {
        scheduler.process_queue();
        if scheduler.is_idle() {
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }

    let mut items = engine.get_queue_history(&QueueHistoryFilter::default());
    items.reverse();
    let stats = engine.stats();

    if json {
        return print_json(&serde_json::json!({
            "items": items,
            "stats": stats,
        }));
    }

    let rows = items
        .iter()
        .map(|i| {
            vec![
                i.automation.id.clone(),
                i.priority.to_string(),
                i.status.to_string(),
                i.attempts.to_string(),
                i.error.clone().unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["AUTOMATION", "PRIORITY", "STATUS", "ATTEMPTS", "ERROR"], rows);
    println!(
        "\n{total} alerts, {} completed, {} failed",
        stats.completed, stats.failed
    );
    Ok(())
}

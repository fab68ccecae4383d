#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn remedy(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("remedy").unwrap();
    cmd.current_dir(dir.path()).env_remove("REMEDY_CONFIG");
    cmd
}

fn write(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Fast retries so failing workflows do not slow the suite down.
const FAST_CONFIG: &str = "scheduler:\n  retry_delay_ms: 1\n  max_retries: 2\n";

const ALERTS: &str = r#"{"type": "cpu", "priority": "high", "timestamp": "2024-06-01T10:00:00Z", "data": {"load": 0.95}}
{"type": "disk", "priority": "low", "timestamp": "2024-06-01T10:01:00Z"}
{"type": "cpu", "priority": "high", "timestamp": "2024-06-01T10:02:00Z", "data": {"load": 0.97}}
{"type": "disk", "priority": "low", "timestamp": "2024-06-01T10:03:00Z"}
{"type": "cpu", "priority": "high", "timestamp": "2024-06-01T10:04:00Z", "data": {"load": 0.40}}
"#;

const RULES: &str = r#"
- id: hot-cpu
  name: Hot CPU
  conditions:
    - kind: type
      value: cpu
    - kind: threshold
      metric: load
      operator: ">="
      value: 0.9
  workflow:
    - type: log
      params:
        message: shedding load
      required: true
"#;

// ---------------------------------------------------------------------------
// remedy config
// ---------------------------------------------------------------------------

#[test]
fn config_validate_defaults_is_clean() {
    let dir = TempDir::new().unwrap();
    remedy(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid. No warnings."));
}

#[test]
fn config_validate_reports_errors() {
    let dir = TempDir::new().unwrap();
    write(&dir, "remedy.yaml", "scheduler:\n  max_concurrent: 0\n");
    remedy(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error] scheduler.max_concurrent"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_validate_warnings_do_not_fail() {
    let dir = TempDir::new().unwrap();
    write(&dir, "remedy.yaml", "state:\n  validate_transitions: false\n");
    remedy(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[warning] state.validate_transitions"));
}

#[test]
fn config_show_fills_in_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "custom.yaml", "scheduler:\n  max_concurrent: 9\n");
    let out = remedy(&dir)
        .args(["config", "show", "--json", "--config"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["scheduler"]["max_concurrent"], 9);
    assert_eq!(v["scheduler"]["max_queue_size"], 100);
    assert_eq!(v["patterns"]["min_confidence"], 0.7);
}

#[test]
fn config_found_in_parent_directory() {
    let dir = TempDir::new().unwrap();
    write(&dir, "remedy.yaml", "engine:\n  max_history: 7\n");
    let nested = dir.path().join("ops/runbooks");
    std::fs::create_dir_all(&nested).unwrap();

    let out = Command::cargo_bin("remedy")
        .unwrap()
        .current_dir(&nested)
        .env_remove("REMEDY_CONFIG")
        .args(["config", "show", "--json"])
        .output()
        .unwrap();
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["engine"]["max_history"], 7);
}

#[test]
fn missing_explicit_config_fails() {
    let dir = TempDir::new().unwrap();
    remedy(&dir)
        .args(["config", "show", "--config", "nope.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

// ---------------------------------------------------------------------------
// remedy patterns
// ---------------------------------------------------------------------------

#[test]
fn patterns_json_report() {
    let dir = TempDir::new().unwrap();
    write(&dir, "remedy.yaml", "patterns:\n  min_confidence: 0.3\n");
    let alerts = write(&dir, "alerts.jsonl", ALERTS);
    let out = remedy(&dir)
        .args(["--json", "patterns", "--alerts"])
        .arg(&alerts)
        .output()
        .unwrap();
    assert!(out.status.success());

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["total_alerts"], 5);
    let keys: Vec<&str> = v["patterns"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["key"].as_str().unwrap())
        .collect();
    assert!(keys.contains(&"cpu:high,cpu:high"));

    let sequences = v["sequences"].as_array().unwrap();
    let cpu_disk = sequences
        .iter()
        .find(|s| s["key"] == "cpu->disk")
        .expect("cpu->disk sequence");
    assert_eq!(cpu_disk["count"], 2);
}

#[test]
fn patterns_empty_file() {
    let dir = TempDir::new().unwrap();
    let alerts = write(&dir, "alerts.jsonl", "# nothing yet\n");
    remedy(&dir)
        .args(["patterns", "--alerts"])
        .arg(&alerts)
        .assert()
        .success()
        .stdout(predicate::str::contains("Alerts analysed: 0"))
        .stdout(predicate::str::contains("No patterns found."));
}

#[test]
fn patterns_rejects_bad_line() {
    let dir = TempDir::new().unwrap();
    let alerts = write(
        &dir,
        "alerts.jsonl",
        "{\"type\": \"cpu\", \"timestamp\": \"2024-06-01T10:00:00Z\"}\n{\"priority\": \"low\"}\n",
    );
    remedy(&dir)
        .args(["patterns", "--alerts"])
        .arg(&alerts)
        .assert()
        .failure()
        .stderr(predicate::str::contains(":2: invalid alert"));
}

// ---------------------------------------------------------------------------
// remedy replay
// ---------------------------------------------------------------------------

#[test]
fn replay_runs_matching_rules() {
    let dir = TempDir::new().unwrap();
    let alerts = write(&dir, "alerts.jsonl", ALERTS);
    let rules = write(&dir, "rules.yaml", RULES);
    let out = remedy(&dir)
        .args(["replay", "--json", "--alerts"])
        .arg(&alerts)
        .arg("--rules")
        .arg(&rules)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let entries = v["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 5);
    let matched: Vec<usize> = entries
        .iter()
        .map(|e| e["automations"].as_array().unwrap().len())
        .collect();
    // Only the first two cpu alerts are above the load threshold.
    assert_eq!(matched, vec![1, 0, 1, 0, 0]);
    assert!(entries.iter().all(|e| e["success"] == true));
}

#[test]
fn replay_table_summarises_failures() {
    let dir = TempDir::new().unwrap();
    let config = write(&dir, "remedy.yaml", FAST_CONFIG);
    let alerts = write(&dir, "alerts.jsonl", ALERTS);
    let rules = write(
        &dir,
        "rules.yaml",
        r#"
- id: always-fails
  conditions:
    - kind: type
      value: disk
  workflow:
    - type: fail
      required: true
"#,
    );
    remedy(&dir)
        .arg("replay")
        .arg("--config")
        .arg(&config)
        .arg("--alerts")
        .arg(&alerts)
        .arg("--rules")
        .arg(&rules)
        .assert()
        .success()
        .stdout(predicate::str::contains("always-fails"))
        .stdout(predicate::str::contains("5 alerts, 2 runs, 2 failed"));
}

#[test]
fn replay_queued_drains_the_scheduler() {
    let dir = TempDir::new().unwrap();
    let alerts = write(&dir, "alerts.jsonl", ALERTS);
    let rules = write(&dir, "rules.yaml", RULES);
    let out = remedy(&dir)
        .args(["replay", "--queued", "--json", "--alerts"])
        .arg(&alerts)
        .arg("--rules")
        .arg(&rules)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let items = v["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i["status"] == "completed"));
    assert!(items.iter().all(|i| i["automation_id"] == "hot-cpu"));
    assert_eq!(v["stats"]["completed"], 2);
}

#[test]
fn replay_queued_waits_for_room_in_a_small_queue() {
    let dir = TempDir::new().unwrap();
    let config = write(
        &dir,
        "remedy.yaml",
        "scheduler:\n  max_queue_size: 1\n  max_concurrent: 1\n",
    );
    let alerts = write(&dir, "alerts.jsonl", ALERTS);
    let rules = write(&dir, "rules.yaml", RULES);
    let out = remedy(&dir)
        .args(["replay", "--queued", "--json", "--config"])
        .arg(&config)
        .arg("--alerts")
        .arg(&alerts)
        .arg("--rules")
        .arg(&rules)
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let items = v["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i["status"] == "completed"));
    assert_eq!(v["stats"]["failed"], 0);
}

#[test]
fn replay_rejects_rule_without_workflow() {
    let dir = TempDir::new().unwrap();
    let alerts = write(&dir, "alerts.jsonl", ALERTS);
    let rules = write(&dir, "rules.yaml", "- id: empty\n  workflow: []\n");
    remedy(&dir)
        .args(["replay", "--alerts"])
        .arg(&alerts)
        .arg("--rules")
        .arg(&rules)
        .assert()
        .failure()
        .stderr(predicate::str::contains("rule #1 rejected"));
}

// ---------------------------------------------------------------------------
// remedy schedule preview
// ---------------------------------------------------------------------------

#[test]
fn schedule_preview_minutes() {
    let dir = TempDir::new().unwrap();
    let out = remedy(&dir)
        .args([
            "schedule",
            "preview",
            "--frequency",
            "minutes",
            "--interval",
            "15",
            "--count",
            "3",
            "--from",
            "2024-06-01T09:00:00Z",
            "--json",
        ])
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(
        v["runs"],
        serde_json::json!([
            "2024-06-01T09:15:00Z",
            "2024-06-01T09:30:00Z",
            "2024-06-01T09:45:00Z"
        ])
    );
}

#[test]
fn schedule_preview_monthly_clamps_to_month_end() {
    let dir = TempDir::new().unwrap();
    remedy(&dir)
        .args([
            "schedule",
            "preview",
            "--frequency",
            "monthly",
            "--count",
            "2",
            "--from",
            "2024-01-31T00:00:00Z",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2024-02-29T00:00:00+00:00"))
        .stdout(predicate::str::contains("2024-03-29T00:00:00+00:00"));
}

#[test]
fn schedule_preview_rejects_unknown_frequency() {
    let dir = TempDir::new().unwrap();
    remedy(&dir)
        .args(["schedule", "preview", "--frequency", "fortnightly"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("fortnightly"));
}

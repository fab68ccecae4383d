use crate::cmd::{load_alerts, load_config};
use crate::output::{print_json, print_table};
use anyhow::Context;
use remedy_core::pattern::PatternDetector;
use std::path::Path;

pub fn run(config_path: Option<&Path>, alerts_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    config
        .ensure_valid()
        .context("config validation found errors")?;
    let alerts = load_alerts(alerts_path)?;

    let detector = PatternDetector::new(config.patterns);
    let report = detector.detect_patterns(&alerts);

    if json {
        return print_json(&report);
    }

    println!("Alerts analysed: {}", report.total_alerts);
    if report.is_empty() {
        println!("No patterns found.");
        return Ok(());
    }

    if !report.patterns.is_empty() {
        println!("\nFrequent patterns");
        let rows = report
            .patterns
            .iter()
            .map(|p| {
                vec![
                    p.key.clone(),
                    p.support.to_string(),
                    format!("{:.2}", p.frequency),
                    p.last_seen.to_rfc3339(),
                ]
            })
            .collect();
        print_table(&["PATTERN", "SUPPORT", "FREQ", "LAST SEEN"], rows);
    }

    if !report.sequences.is_empty() {
        println!("\nSequences");
        let rows = report
            .sequences
            .iter()
            .map(|s| {
                vec![
                    s.key.clone(),
                    s.count.to_string(),
                    format!("{:.2}", s.confidence),
                    format!("{:.0}s", s.avg_gap_secs),
                ]
            })
            .collect();
        print_table(&["SEQUENCE", "COUNT", "CONFIDENCE", "AVG GAP"], rows);
    }

    if !report.correlations.is_empty() {
        println!("\nCorrelations");
        let rows = report
            .correlations
            .iter()
            .map(|c| {
                vec![
                    c.key.clone(),
                    format!("{}/{}", c.co_occurrences, c.windows),
                    format!("{:.2}", c.confidence),
                ]
            })
            .collect();
        print_table(&["TYPES", "WINDOWS", "CONFIDENCE"], rows);
    }

    Ok(())
}

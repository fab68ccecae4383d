//! Pattern mining over the rolling alert window.
//!
//! Three kinds of structure are derived, all recomputed from scratch on each
//! detection cycle:
//!
//! - frequent patterns: per-type windows of `L` consecutive alerts whose
//!   timestamps span at most `time_window`, keyed `"type:priority,…"`;
//! - sequences: timestamp-adjacent alert pairs no more than `max_time_gap`
//!   apart, keyed `"typeA->typeB"`;
//! - correlations: pairs of distinct types sharing fixed `time_window`
//!   buckets, keyed `"typeA<->typeB"` with the names in lexical order.
//!
//! Support and confidence ratios are taken over the number of well-formed
//! alerts in the input.

use crate::alert::Alert;
use crate::condition::{Condition, PatternScope};
use crate::config::PatternConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, RwLock};

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequentPattern {
    pub key: String,
    pub alert_type: String,
    pub length: usize,
    pub support: usize,
    pub frequency: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequentialPattern {
    pub key: String,
    pub from: String,
    pub to: String,
    pub count: usize,
    pub confidence: f64,
    pub avg_gap_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub key: String,
    pub type_a: String,
    pub type_b: String,
    pub co_occurrences: usize,
    pub windows: usize,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternReport {
    pub patterns: Vec<FrequentPattern>,
    pub sequences: Vec<SequentialPattern>,
    pub correlations: Vec<Correlation>,
    pub total_alerts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
}

impl PatternReport {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.sequences.is_empty() && self.correlations.is_empty()
    }

    /// Whether `key` is present in the given scope (or any scope for `None`).
    pub fn contains(&self, key: &str, scope: Option<PatternScope>) -> bool {
        let frequent = || self.patterns.iter().any(|p| p.key == key);
        let sequence = || self.sequences.iter().any(|s| s.key == key);
        let correlation = || self.correlations.iter().any(|c| c.key == key);
        match scope {
            Some(PatternScope::Frequent) => frequent(),
            Some(PatternScope::Sequence) => sequence(),
            Some(PatternScope::Correlation) => correlation(),
            None => frequent() || sequence() || correlation(),
        }
    }
}

pub fn correlation_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}<->{b}")
    } else {
        format!("{b}<->{a}")
    }
}

// ---------------------------------------------------------------------------
// Mining
// ---------------------------------------------------------------------------

/// Mine `alerts` with the thresholds in `cfg`. Malformed alerts (empty type)
/// are skipped; an empty input yields an empty report.
pub fn detect_patterns(alerts: &[Alert], cfg: &PatternConfig) -> PatternReport {
    let mut valid: Vec<&Alert> = alerts
        .iter()
        .filter(|a| !a.alert_type.trim().is_empty())
        .collect();
    if valid.is_empty() {
        return PatternReport::default();
    }
    valid.sort_by_key(|a| a.timestamp);
    let total = valid.len();

    PatternReport {
        patterns: frequent_patterns(&valid, total, cfg),
        sequences: sequential_patterns(&valid, total, cfg),
        correlations: correlations(&valid, cfg),
        total_alerts: total,
        detected_at: None,
    }
}

struct PatternTally {
    alert_type: String,
    length: usize,
    support: usize,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

fn frequent_patterns(sorted: &[&Alert], total: usize, cfg: &PatternConfig) -> Vec<FrequentPattern> {
    let mut by_type: BTreeMap<&str, Vec<&Alert>> = BTreeMap::new();
    for alert in sorted {
        by_type.entry(alert.alert_type.as_str()).or_default().push(alert);
    }

    let span_limit = cfg.time_window();
    let mut tallies: BTreeMap<String, PatternTally> = BTreeMap::new();

    for (alert_type, series) in &by_type {
        for len in cfg.min_pattern_length.max(1)..=cfg.max_pattern_length {
            if len > series.len() {
                break;
            }
            for window in series.windows(len) {
                let first = window[0].timestamp;
                let last = window[len - 1].timestamp;
                if last - first > span_limit {
                    continue;
                }
                let key = window
                    .iter()
                    .map(|a| format!("{}:{}", a.alert_type, a.priority))
                    .collect::<Vec<_>>()
                    .join(",");
                let tally = tallies.entry(key).or_insert_with(|| PatternTally {
                    alert_type: (*alert_type).to_string(),
                    length: len,
                    support: 0,
                    first_seen: first,
                    last_seen: last,
                });
                tally.support += 1;
                tally.first_seen = tally.first_seen.min(first);
                tally.last_seen = tally.last_seen.max(last);
            }
        }
    }

    let mut out: Vec<FrequentPattern> = tallies
        .into_iter()
        .filter_map(|(key, t)| {
            let frequency = t.support as f64 / total as f64;
            (frequency >= cfg.min_support).then(|| FrequentPattern {
                key,
                alert_type: t.alert_type,
                length: t.length,
                support: t.support,
                frequency,
                first_seen: t.first_seen,
                last_seen: t.last_seen,
            })
        })
        .collect();
    out.sort_by(|a, b| b.support.cmp(&a.support).then_with(|| a.key.cmp(&b.key)));
    out
}

fn sequential_patterns(
    sorted: &[&Alert],
    total: usize,
    cfg: &PatternConfig,
) -> Vec<SequentialPattern> {
    let max_gap = cfg.max_time_gap();
    // key -> (from, to, count, summed gap in seconds)
    let mut tallies: BTreeMap<String, (String, String, usize, f64)> = BTreeMap::new();

    for pair in sorted.windows(2) {
        let (current, next) = (pair[0], pair[1]);
        let gap = next.timestamp - current.timestamp;
        if gap > max_gap {
            continue;
        }
        let key = format!("{}->{}", current.alert_type, next.alert_type);
        let entry = tallies.entry(key).or_insert_with(|| {
            (
                current.alert_type.clone(),
                next.alert_type.clone(),
                0,
                0.0,
            )
        });
        entry.2 += 1;
        entry.3 += gap.num_milliseconds() as f64 / 1000.0;
    }

    let mut out: Vec<SequentialPattern> = tallies
        .into_iter()
        .filter_map(|(key, (from, to, count, gap_sum))| {
            let confidence = count as f64 / total as f64;
            (confidence >= cfg.min_confidence).then(|| SequentialPattern {
                key,
                from,
                to,
                count,
                confidence,
                avg_gap_secs: gap_sum / count as f64,
            })
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    out
}

fn correlations(sorted: &[&Alert], cfg: &PatternConfig) -> Vec<Correlation> {
    let window_ms = cfg.time_window().num_milliseconds().max(1000);
    let mut buckets: BTreeMap<i64, BTreeSet<&str>> = BTreeMap::new();
    let mut types: BTreeSet<&str> = BTreeSet::new();
    for alert in sorted {
        let bucket = alert.timestamp.timestamp_millis().div_euclid(window_ms);
        buckets
            .entry(bucket)
            .or_default()
            .insert(alert.alert_type.as_str());
        types.insert(alert.alert_type.as_str());
    }

    let total_windows = buckets.len();
    let types: Vec<&str> = types.into_iter().collect();
    let mut out = Vec::new();
    for (i, a) in types.iter().enumerate() {
        for b in &types[i + 1..] {
            let both = buckets
                .values()
                .filter(|set| set.contains(a) && set.contains(b))
                .count();
            if both == 0 {
                continue;
            }
            let confidence = both as f64 / total_windows as f64;
            if confidence >= cfg.min_confidence {
                out.push(Correlation {
                    key: correlation_key(a, b),
                    type_a: (*a).to_string(),
                    type_b: (*b).to_string(),
                    co_occurrences: both,
                    windows: total_windows,
                    confidence,
                });
            }
        }
    }
    out.sort_by(|x, y| {
        y.confidence
            .total_cmp(&x.confidence)
            .then_with(|| x.key.cmp(&y.key))
    });
    out
}

// ---------------------------------------------------------------------------
// PatternDetector
// ---------------------------------------------------------------------------

/// Holds the rolling alert window and the most recent detection report.
pub struct PatternDetector {
    config: PatternConfig,
    window: Mutex<VecDeque<Alert>>,
    report: RwLock<PatternReport>,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self {
            config,
            window: Mutex::new(VecDeque::new()),
            report: RwLock::new(PatternReport::default()),
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Add an alert to the mining window, evicting the oldest beyond capacity.
    pub fn observe(&self, alert: &Alert) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.push_back(alert.clone());
        while window.len() > self.config.max_window_alerts {
            window.pop_front();
        }
    }

    /// Drop alerts older than the retention window. Returns how many left.
    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.window_retention();
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let before = window.len();
        window.retain(|a| a.timestamp >= cutoff);
        before - window.len()
    }

    pub fn window_len(&self) -> usize {
        self.window.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Mine `alerts` without touching the window or the cached report.
    pub fn detect_patterns(&self, alerts: &[Alert]) -> PatternReport {
        detect_patterns(alerts, &self.config)
    }

    /// Run one detection cycle over the current window and cache the result.
    pub fn detect_at(&self, now: DateTime<Utc>) -> PatternReport {
        self.prune_at(now);
        let snapshot: Vec<Alert> = {
            let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            window.iter().cloned().collect()
        };
        let mut report = detect_patterns(&snapshot, &self.config);
        report.detected_at = Some(now);
        tracing::debug!(
            alerts = report.total_alerts,
            patterns = report.patterns.len(),
            sequences = report.sequences.len(),
            correlations = report.correlations.len(),
            "pattern detection cycle"
        );
        if let Ok(mut cached) = self.report.write() {
            *cached = report.clone();
        }
        report
    }

    pub fn detect(&self) -> PatternReport {
        self.detect_at(Utc::now())
    }

    pub fn report(&self) -> PatternReport {
        self.report.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn get_patterns(&self) -> Vec<FrequentPattern> {
        self.report().patterns
    }

    pub fn get_sequences(&self) -> Vec<SequentialPattern> {
        self.report().sequences
    }

    pub fn get_correlations(&self) -> Vec<Correlation> {
        self.report().correlations
    }

    /// One pattern-match condition per currently detected pattern, for
    /// registering rules that react to recurring alert signatures.
    pub fn suggest_conditions(&self) -> Vec<Condition> {
        let report = self.report();
        report
            .patterns
            .iter()
            .map(|p| Condition::Pattern {
                key: p.key.clone(),
                scope: Some(PatternScope::Frequent),
            })
            .chain(report.sequences.iter().map(|s| Condition::Pattern {
                key: s.key.clone(),
                scope: Some(PatternScope::Sequence),
            }))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn alert(kind: &str, priority: Priority, offset_secs: i64) -> Alert {
        Alert::new(kind, priority, t0() + Duration::seconds(offset_secs))
    }

    fn cfg() -> PatternConfig {
        PatternConfig {
            min_pattern_length: 2,
            max_pattern_length: 3,
            min_support: 0.0,
            min_confidence: 0.0,
            time_window_secs: 3600,
            max_time_gap_secs: 60,
            ..PatternConfig::default()
        }
    }

    #[test]
    fn empty_input_yields_empty_report() {
        let report = detect_patterns(&[], &PatternConfig::default());
        assert!(report.is_empty());
        assert_eq!(report.total_alerts, 0);
    }

    #[test]
    fn malformed_alerts_are_skipped() {
        let mut bad = alert("cpu", Priority::High, 0);
        bad.alert_type = "  ".into();
        let report = detect_patterns(&[bad], &cfg());
        assert!(report.is_empty());
        assert_eq!(report.total_alerts, 0);
    }

    #[test]
    fn frequent_patterns_are_type_local_and_span_limited() {
        let alerts = vec![
            alert("cpu", Priority::High, 0),
            alert("disk", Priority::Low, 10),
            alert("cpu", Priority::High, 20),
            alert("cpu", Priority::Critical, 7200),
        ];
        let report = detect_patterns(&alerts, &cfg());
        let keys: Vec<&str> = report.patterns.iter().map(|p| p.key.as_str()).collect();
        assert!(keys.contains(&"cpu:high,cpu:high"));
        // second window spans two hours and is excluded
        assert!(!keys.contains(&"cpu:high,cpu:critical"));
        assert!(!keys.iter().any(|k| k.contains("disk")));
        let p = &report.patterns[0];
        assert_eq!(p.support, 1);
        assert!((p.frequency - 0.25).abs() < 1e-9);
    }

    #[test]
    fn pattern_last_seen_is_the_window_end() {
        let alerts = vec![
            alert("cpu", Priority::High, 0),
            alert("cpu", Priority::High, 40),
            alert("cpu", Priority::High, 90),
        ];
        let mut c = cfg();
        c.max_pattern_length = 2;
        let report = detect_patterns(&alerts, &c);
        let p = report
            .patterns
            .iter()
            .find(|p| p.key == "cpu:high,cpu:high")
            .unwrap();
        assert_eq!(p.support, 2);
        assert_eq!(p.first_seen, t0());
        assert_eq!(p.last_seen, t0() + Duration::seconds(90));
    }

    #[test]
    fn huge_time_window_does_not_overflow() {
        let mut c = cfg();
        c.time_window_secs = u64::MAX;
        let alerts = vec![alert("db", Priority::High, 0), alert("api", Priority::High, 10)];
        let report = detect_patterns(&alerts, &c);
        assert_eq!(report.correlations.len(), 1);
        assert_eq!(report.correlations[0].windows, 1);
    }

    #[test]
    fn min_support_filters_patterns() {
        let alerts = vec![
            alert("cpu", Priority::High, 0),
            alert("cpu", Priority::High, 5),
            alert("cpu", Priority::High, 10),
            alert("net", Priority::Low, 15),
        ];
        let mut c = cfg();
        c.min_support = 0.5;
        let report = detect_patterns(&alerts, &c);
        // "cpu:high,cpu:high" occurs twice out of four alerts
        assert_eq!(report.patterns.len(), 1);
        assert_eq!(report.patterns[0].key, "cpu:high,cpu:high");
        assert_eq!(report.patterns[0].support, 2);
    }

    #[test]
    fn sequences_respect_max_gap() {
        let alerts = vec![
            alert("A", Priority::Low, 0),
            alert("B", Priority::Low, 30),
            alert("A", Priority::Low, 500),
            alert("B", Priority::Low, 520),
        ];
        let report = detect_patterns(&alerts, &cfg());
        let ab = report.sequences.iter().find(|s| s.key == "A->B").unwrap();
        assert_eq!(ab.count, 2);
        assert!((ab.confidence - 0.5).abs() < 1e-9);
        assert!((ab.avg_gap_secs - 25.0).abs() < 1e-9);
        // B at 30s and A at 500s are too far apart
        assert!(report.sequences.iter().all(|s| s.key != "B->A"));
    }

    #[test]
    fn correlations_count_shared_buckets() {
        let mut c = cfg();
        c.time_window_secs = 60;
        c.min_confidence = 0.5;
        // buckets are aligned to epoch multiples of 60s; t0 is on a minute
        let alerts = vec![
            alert("db", Priority::High, 0),
            alert("api", Priority::High, 10),
            alert("db", Priority::High, 70),
            alert("api", Priority::High, 80),
            alert("db", Priority::High, 130),
        ];
        let report = detect_patterns(&alerts, &c);
        assert_eq!(report.correlations.len(), 1);
        let corr = &report.correlations[0];
        assert_eq!(corr.key, "api<->db");
        assert_eq!(corr.co_occurrences, 2);
        assert_eq!(corr.windows, 3);
        assert!((corr.confidence - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn detector_window_prunes_and_caches() {
        let mut c = cfg();
        c.window_retention_secs = 600;
        c.max_window_alerts = 3;
        let detector = PatternDetector::new(c);
        for i in 0..5 {
            detector.observe(&alert("cpu", Priority::High, i * 10));
        }
        assert_eq!(detector.window_len(), 3);

        let report = detector.detect_at(t0() + Duration::seconds(60));
        assert_eq!(report.total_alerts, 3);
        assert_eq!(detector.report(), report);
        assert!(!detector.get_patterns().is_empty());

        let dropped = detector.prune_at(t0() + Duration::seconds(3600));
        assert_eq!(dropped, 3);
        assert_eq!(detector.window_len(), 0);
    }

    #[test]
    fn suggestions_mirror_report() {
        let detector = PatternDetector::new(cfg());
        detector.observe(&alert("cpu", Priority::High, 0));
        detector.observe(&alert("cpu", Priority::High, 5));
        detector.detect_at(t0() + Duration::seconds(10));
        let suggestions = detector.suggest_conditions();
        assert!(suggestions.contains(&Condition::Pattern {
            key: "cpu:high,cpu:high".into(),
            scope: Some(PatternScope::Frequent),
        }));
        assert!(suggestions.contains(&Condition::Pattern {
            key: "cpu->cpu".into(),
            scope: Some(PatternScope::Sequence),
        }));
    }
}

use std::collections::{HashMap, VecDeque};

/// Bounded per-metric sample series feeding trend conditions.
#[derive(Debug, Clone)]
pub struct MetricHistory {
    max_samples: usize,
    series: HashMap<String, VecDeque<f64>>,
}

impl MetricHistory {
    pub fn new(max_samples: usize) -> Self {
        Self {
            max_samples: max_samples.max(2),
            series: HashMap::new(),
        }
    }

    pub fn record(&mut self, path: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        let samples = self.series.entry(path.to_string()).or_default();
        samples.push_back(value);
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    pub fn samples(&self, path: &str) -> Option<&VecDeque<f64>> {
        self.series.get(path)
    }

    /// Least-squares slope over the most recent `window` samples, using the
    /// sample index as x. `None` with fewer than two samples.
    pub fn slope(&self, path: &str, window: usize) -> Option<f64> {
        let samples = self.series.get(path)?;
        let take = window.min(samples.len());
        if take < 2 {
            return None;
        }
        let ys: Vec<f64> = samples.iter().skip(samples.len() - take).copied().collect();
        Some(linear_slope(&ys))
    }
}

impl Default for MetricHistory {
    fn default() -> Self {
        Self::new(100)
    }
}

fn linear_slope(ys: &[f64]) -> f64 {
    let n = ys.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

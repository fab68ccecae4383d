pub mod config;
pub mod patterns;
pub mod replay;
pub mod schedule;

use anyhow::Context;
use remedy_core::config::Config;
use remedy_core::io::read_json_lines;
use remedy_core::Alert;
use std::path::Path;

/// The config at `path`, or built-in defaults when no file was found.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::load(p).with_context(|| format!("failed to load config {}", p.display())),
        None => Ok(Config::default()),
    }
}

/// Parse a JSON Lines alert file. Any malformed line fails the whole load.
pub fn load_alerts(path: &Path) -> anyhow::Result<Vec<Alert>> {
    let lines = read_json_lines(path)
        .with_context(|| format!("failed to read alerts from {}", path.display()))?;
    lines
        .into_iter()
        .map(|(line, value)| {
            Alert::from_value(value)
                .with_context(|| format!("{}:{line}: invalid alert", path.display()))
        })
        .collect()
}

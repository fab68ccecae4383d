use crate::error::Result;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Atomically write `data` to `path` using a tempfile in the same directory.
/// Prevents partial writes from corrupting config files.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a JSON Lines file into `(line_number, value)` pairs.
///
/// Blank lines and `#` comments are skipped. A line that is not valid JSON is
/// returned as an error naming its 1-based line number.
pub fn read_json_lines(path: &Path) -> Result<Vec<(usize, serde_json::Value)>> {
    let content = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let value = serde_json::from_str(trimmed).map_err(|e| {
            crate::error::RemedyError::Validation(format!(
                "{}:{}: invalid JSON: {e}",
                path.display(),
                i + 1
            ))
        })?;
        out.push((i + 1, value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/remedy.yaml");
        atomic_write(&path, b"data").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "data");
    }

    #[test]
    fn json_lines_skip_blank_and_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alerts.jsonl");
        std::fs::write(&path, "# header\n{\"a\":1}\n\n{\"a\":2}\n").unwrap();
        let rows = read_json_lines(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, 2);
        assert_eq!(rows[1].1["a"], 2);
    }

    #[test]
    fn json_lines_report_bad_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alerts.jsonl");
        std::fs::write(&path, "{\"a\":1}\nnot json\n").unwrap();
        let err = read_json_lines(&path).unwrap_err().to_string();
        assert!(err.contains(":2:"), "{err}");
    }
}

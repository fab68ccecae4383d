use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "remedy.yaml";

/// Resolve which config file to load.
///
/// Priority:
/// 1. `--config` flag / `REMEDY_CONFIG` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `remedy.yaml`
/// 3. None: built-in defaults
pub fn resolve_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    let cwd = std::env::current_dir().ok()?;
    find_upward(&cwd)
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    let mut dir = start;
    loop {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_path_wins() {
        let p = PathBuf::from("/etc/remedy/custom.yaml");
        assert_eq!(resolve_config(Some(&p)), Some(p));
    }

    #[test]
    fn finds_file_in_ancestor() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_upward(&nested), Some(dir.path().join(CONFIG_FILE)));
    }
}

//! Path normalization for configured directories.

use std::path::{Path, PathBuf};

/// Expand a configured path into a host path.
///
/// A leading `~` resolves against the user's home directory. Separators are
/// left to the OS: paths are rebuilt from their components so forward
/// slashes in the YAML config work on every platform.
pub fn normalize(path: &str) -> PathBuf {
    let expanded = if let Some(rest) = path.strip_prefix('~') {
        match dirs::home_dir() {
            Some(home) => {
                let rest = rest.trim_start_matches(['/', '\\']);
                home.join(rest)
            }
            None => PathBuf::from(path),
        }
    } else {
        PathBuf::from(path)
    };

    clean(&expanded)
}

/// Resolve `.` and `..` components without touching the filesystem.
fn clean(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(normalize("~/zephyr/data"), home.join("zephyr/data"));
    }

    #[test]
    fn relative_components_are_cleaned() {
        assert_eq!(normalize("/a/b/../c/./d"), PathBuf::from("/a/c/d"));
    }

    #[test]
    fn plain_paths_pass_through() {
        assert_eq!(normalize("/var/lib/zephyr"), PathBuf::from("/var/lib/zephyr"));
    }
}

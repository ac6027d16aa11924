//! Locating the configuration file.

use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "HERMES_CONFIG";

pub const DEFAULT_PATHS: [&str; 2] = ["./hermes.config.ron", "/etc/hermes/hermes.config.ron"];

/// Find the configuration file using the following precedence:
/// 1. `--config` on the command line
/// 2. `HERMES_CONFIG` environment variable
/// 3. ./hermes.config.ron (current working directory)
/// 4. /etc/hermes/hermes.config.ron (system-wide config)
///
/// # Errors
/// If an explicitly named file does not exist, or none of the defaults do.
pub fn find_config_file(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let defaults: Vec<PathBuf> = DEFAULT_PATHS.iter().map(PathBuf::from).collect();
    locate(
        explicit,
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &defaults,
    )
}

/// [`find_config_file`] with the environment and default paths supplied.
///
/// # Errors
/// See [`find_config_file`].
pub fn locate(
    explicit: Option<&Path>,
    env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("--config points to non-existent file: {}", path.display());
    }

    if let Some(path) = env {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        );
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::locate;

    #[test]
    fn explicit_path_wins() {
        let explicit = tempfile::NamedTempFile::new().unwrap();
        let env = tempfile::NamedTempFile::new().unwrap();

        let found = locate(
            Some(explicit.path()),
            Some(env.path().to_path_buf()),
            &[],
        )
        .unwrap();
        assert_eq!(found, explicit.path());
    }

    #[test]
    fn environment_before_defaults() {
        let env = tempfile::NamedTempFile::new().unwrap();
        let default = tempfile::NamedTempFile::new().unwrap();

        let found = locate(
            None,
            Some(env.path().to_path_buf()),
            &[default.path().to_path_buf()],
        )
        .unwrap();
        assert_eq!(found, env.path());
    }

    #[test]
    fn missing_environment_path_is_an_error() {
        let default = tempfile::NamedTempFile::new().unwrap();

        let err = locate(
            None,
            Some(PathBuf::from("/nonexistent/hermes.config.ron")),
            &[default.path().to_path_buf()],
        )
        .unwrap_err();
        assert!(err.to_string().contains("HERMES_CONFIG"));
    }

    #[test]
    fn first_existing_default() {
        let second = tempfile::NamedTempFile::new().unwrap();
        let defaults = [
            PathBuf::from("/nonexistent/hermes.config.ron"),
            second.path().to_path_buf(),
        ];

        assert_eq!(locate(None, None, &defaults).unwrap(), second.path());
    }

    #[test]
    fn nothing_found_lists_candidates() {
        let defaults = [PathBuf::from("/nonexistent/hermes.config.ron")];
        let err = locate(None, None, &defaults).unwrap_err().to_string();

        assert!(err.contains("No configuration file found"));
        assert!(err.contains("/nonexistent/hermes.config.ron"));
    }
}

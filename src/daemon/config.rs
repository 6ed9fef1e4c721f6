//! Daemon configuration
//!
//! The root directory comes from `FDEMANAGERD_TARGET_ROOT` (default `/`).
//! Timings can be overridden from `<root>/etc/fdemanagerd.conf`, a file of shell-style
//! assignments:
//! - ENSURE_INTERVAL, PRUNE_INTERVAL, PRUNE_WAIT, ABORT_WAIT (seconds)
//! - PRUNE_MAX_CHANGES
//! - SHUTDOWN_TIMEOUT (seconds)
//! - STANDBY_WAIT, STANDBY_MAX_WAIT (seconds)

use crate::overlord::Timings;
use crate::paths::Paths;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the root directory
pub const ROOT_ENV: &str = "FDEMANAGERD_TARGET_ROOT";

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub root: PathBuf,
    pub timings: Timings,
    /// Grace period for in-flight requests at shutdown
    pub shutdown_timeout: Duration,
    /// First standby poll interval; doubles up to `standby_max_wait`
    pub standby_wait: Duration,
    pub standby_max_wait: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            timings: Timings::default(),
            shutdown_timeout: Duration::from_secs(25),
            standby_wait: Duration::from_secs(5),
            standby_max_wait: Duration::from_secs(5 * 60),
        }
    }
}

impl DaemonConfig {
    /// Defaults, rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::default().with_root(root)
    }

    /// Configuration from the environment and the config file under the root
    pub fn from_env() -> Self {
        let root = env::var_os(ROOT_ENV)
            .filter(|root| !root.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        let config_file = Paths::new(&root).config_file;
        Self::from_file(&config_file)
            .unwrap_or_default()
            .with_root(root)
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn paths(&self) -> Paths {
        Paths::new(&self.root)
    }

    /// Parse configuration from content string. Unknown keys and unparsable
    /// values are ignored.
    pub fn parse(content: &str) -> Self {
        let mut config = DaemonConfig::default();

        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = parse_assignment(line) else {
                continue;
            };
            let value = unquote(&value);

            match key.as_str() {
                "ENSURE_INTERVAL" => set_secs(&mut config.timings.ensure_interval, &value),
                "PRUNE_INTERVAL" => set_secs(&mut config.timings.prune_interval, &value),
                "PRUNE_WAIT" => set_secs(&mut config.timings.prune_wait, &value),
                "ABORT_WAIT" => set_secs(&mut config.timings.abort_wait, &value),
                "PRUNE_MAX_CHANGES" => {
                    if let Ok(max) = value.parse::<usize>() {
                        config.timings.prune_max_changes = max;
                    }
                }
                "SHUTDOWN_TIMEOUT" => set_secs(&mut config.shutdown_timeout, &value),
                "STANDBY_WAIT" => set_secs(&mut config.standby_wait, &value),
                "STANDBY_MAX_WAIT" => set_secs(&mut config.standby_max_wait, &value),
                _ => {}
            }
        }

        config
    }
}

fn set_secs(target: &mut Duration, value: &str) {
    if let Ok(secs) = value.parse::<u64>() {
        *target = Duration::from_secs(secs);
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();

    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    Some((key.to_string(), value.trim().to_string()))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();

    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }

    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config = DaemonConfig::parse("");
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(25));
    }

    #[test]
    fn test_parse_timings() {
        let content = r#"
ENSURE_INTERVAL=60
PRUNE_INTERVAL="120"
PRUNE_WAIT='3600'
ABORT_WAIT=7200
PRUNE_MAX_CHANGES=10
SHUTDOWN_TIMEOUT=3
STANDBY_WAIT=1
STANDBY_MAX_WAIT=30
"#;
        let config = DaemonConfig::parse(content);

        assert_eq!(config.timings.ensure_interval, Duration::from_secs(60));
        assert_eq!(config.timings.prune_interval, Duration::from_secs(120));
        assert_eq!(config.timings.prune_wait, Duration::from_secs(3600));
        assert_eq!(config.timings.abort_wait, Duration::from_secs(7200));
        assert_eq!(config.timings.prune_max_changes, 10);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(config.standby_wait, Duration::from_secs(1));
        assert_eq!(config.standby_max_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_with_export_and_comments() {
        let content = r#"
# shorter grace period on this box
export SHUTDOWN_TIMEOUT=5
# ENSURE_INTERVAL=1
"#;
        let config = DaemonConfig::parse(content);

        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.timings.ensure_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_ignores_garbage() {
        let content = r#"
ENSURE_INTERVAL=soon
NOT A KEY=1
UNKNOWN_KEY=1
PRUNE_MAX_CHANGES=-3
"#;
        assert_eq!(DaemonConfig::parse(content), DaemonConfig::default());
    }

    #[test]
    fn test_from_file_and_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fdemanagerd.conf");
        fs::write(&path, "STANDBY_WAIT=2\n").unwrap();

        let config = DaemonConfig::from_file(&path).unwrap().with_root(dir.path());
        assert_eq!(config.standby_wait, Duration::from_secs(2));
        assert_eq!(config.paths().socket, dir.path().join("run/fdemanagerd.socket"));

        assert!(DaemonConfig::from_file(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_from_env_reads_target_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/fdemanagerd.conf"), "SHUTDOWN_TIMEOUT=7\n").unwrap();

        env::set_var(ROOT_ENV, dir.path());
        let config = DaemonConfig::from_env();
        env::remove_var(ROOT_ENV);

        assert_eq!(config.root, dir.path());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("  \"hello\"  "), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}

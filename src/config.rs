use std::path::PathBuf;

/// Every runtime tunable, loaded once from the environment at startup.
///
/// Mirrors the environment-variable surface of the reference deployment:
/// a container with env vars only, no on-disk project config to layer.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Root directory holding `client_data/<project_id>` and
    /// `server_data/<project_id>` subtrees.
    pub workspace_root: PathBuf,
    pub bind_host: String,
    pub bind_port: u16,

    /// Seconds to wait after the polite termination signal before the
    /// uninterruptible group kill.
    pub grace_period_secs: u64,
    pub build_timeout_secs: u64,
    /// Overall test-phase deadline when no task-local runner is present.
    pub generic_test_timeout_secs: u64,
    /// Overall test-phase deadline when a task-local runner is present.
    pub incremental_test_timeout_secs: u64,
    pub per_test_timeout_secs: u64,
    pub sse_keepalive_interval_secs: u64,
    /// Cap on captured stdout+stderr bytes retained per phase.
    pub captured_output_cap_bytes: usize,

    pub build_argv: Vec<String>,
    pub generic_test_argv: Vec<String>,
    /// Argv template for the incremental runner; flags for per-test
    /// timeout / name filter / file filter are appended by the pipeline.
    pub incremental_test_argv: Vec<String>,
    /// Filename whose presence in a materialised project selects the
    /// incremental runner path.
    pub incremental_runner_marker: String,
}

impl HarnessConfig {
    /// Load from the environment, falling back to the defaults observed in
    /// the reference deployment for anything unset.
    pub fn from_env() -> Self {
        Self {
            workspace_root: env_path("HARNESS_WORKSPACE_ROOT", "/workspace"),
            bind_host: env_string("HARNESS_BIND_HOST", "0.0.0.0"),
            bind_port: env_parse("HARNESS_BIND_PORT", 8080),

            grace_period_secs: env_parse("HARNESS_GRACE_PERIOD", 5),
            build_timeout_secs: env_parse("HARNESS_BUILD_TIMEOUT", 120),
            generic_test_timeout_secs: env_parse("HARNESS_MOON_TEST_TIMEOUT", 10_800),
            incremental_test_timeout_secs: env_parse("HARNESS_CDCL_TEST_TIMEOUT", 10_800),
            per_test_timeout_secs: env_parse("HARNESS_PER_TEST_TIMEOUT", 10),
            sse_keepalive_interval_secs: env_parse("HARNESS_SSE_KEEPALIVE_INTERVAL", 15),
            captured_output_cap_bytes: env_parse("HARNESS_OUTPUT_CAP_BYTES", 1024 * 1024),

            build_argv: env_argv("HARNESS_BUILD_ARGV", &["moon", "test", "--build-only"]),
            generic_test_argv: env_argv(
                "HARNESS_GENERIC_TEST_ARGV",
                &["moon", "test", "--test-failure-json"],
            ),
            incremental_test_argv: env_argv(
                "HARNESS_INCREMENTAL_TEST_ARGV",
                &["python3", "try.py", "--json"],
            ),
            incremental_runner_marker: env_string("HARNESS_INCREMENTAL_MARKER", "try.py"),
        }
    }

    pub fn client_data_dir(&self, project_id: &str) -> PathBuf {
        self.workspace_root.join("client_data").join(project_id)
    }

    pub fn server_data_dir(&self, project_id: &str) -> PathBuf {
        self.workspace_root.join("server_data").join(project_id)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_argv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.split_whitespace().map(String::from).collect(),
        _ => default.iter().map(|s| s.to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        // Isolated by not setting any HARNESS_* env vars in this process.
        let cfg = HarnessConfig::from_env();
        assert_eq!(cfg.grace_period_secs, 5);
        assert_eq!(cfg.build_timeout_secs, 120);
        assert_eq!(cfg.generic_test_timeout_secs, 10_800);
        assert_eq!(cfg.incremental_test_timeout_secs, 10_800);
        assert_eq!(cfg.per_test_timeout_secs, 10);
        assert_eq!(cfg.sse_keepalive_interval_secs, 15);
        assert_eq!(cfg.build_argv, vec!["moon", "test", "--build-only"]);
        assert_eq!(
            cfg.generic_test_argv,
            vec!["moon", "test", "--test-failure-json"]
        );
    }

    #[test]
    fn server_data_dir_is_scoped_by_project() {
        let cfg = HarnessConfig::from_env();
        let dir = cfg.server_data_dir("demo");
        assert!(dir.ends_with("server_data/demo"));
    }
}

//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use eigen_local::paths;

/// System prompt used when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Eigen, a helpful AI assistant.\n\n\
Rules:\n\
- Use Markdown for formatting.\n\
- Use LaTeX ($...$ / $$...$$) for math.\n\
- If you don't know, say \"I don't know\".";

/// Configuration for the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root for models, binaries and persisted selection (default: ~/.eigen)
    pub data_dir: PathBuf,
    /// llama-server binary (default: <data_dir>/bin/llama-server)
    pub server_binary: PathBuf,
    /// Fixed server port; an ephemeral one is chosen when unset
    pub port: Option<u16>,
    /// Context window passed to llama-server
    pub context_length: u32,
    /// Maximum tokens per reply
    pub max_tokens: u32,
    pub system_prompt: String,
    /// Prior turns included in each prompt
    pub history_limit: usize,
    /// Model to load on boot when nothing was selected before
    pub preferred_model: Option<String>,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub health_interval: Duration,
    pub stream_idle_timeout: Duration,
    pub download_idle_timeout: Duration,
    /// Minimum spacing of download progress events
    pub progress_interval: Duration,
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let data_dir = paths::default_data_dir();
        Self {
            server_binary: paths::llama_server_path(&data_dir),
            data_dir,
            port: None,
            context_length: 8192,
            max_tokens: 4096,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_limit: 20,
            preferred_model: None,
            startup_timeout: eigen_local::server::DEFAULT_STARTUP_TIMEOUT,
            shutdown_grace: eigen_local::server::DEFAULT_SHUTDOWN_GRACE,
            health_interval: eigen_local::server::DEFAULT_HEALTH_INTERVAL,
            stream_idle_timeout: Duration::from_secs(120),
            download_idle_timeout: eigen_local::download::DEFAULT_IDLE_TIMEOUT,
            progress_interval: eigen_local::download::DEFAULT_PROGRESS_INTERVAL,
            event_capacity: eigen_local::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let data_dir = lookup("EIGEN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let server_binary = lookup("EIGEN_SERVER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|| paths::llama_server_path(&data_dir));

        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            data_dir,
            server_binary,
            port: parsed("EIGEN_PORT").and_then(|p| u16::try_from(p).ok()),
            context_length: parsed("EIGEN_CTX_SIZE")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.context_length),
            max_tokens: parsed("EIGEN_MAX_TOKENS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.max_tokens),
            system_prompt: lookup("EIGEN_SYSTEM_PROMPT")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.system_prompt),
            preferred_model: lookup("EIGEN_MODEL").filter(|s| !s.is_empty()),
            startup_timeout: parsed("EIGEN_STARTUP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.startup_timeout),
            ..defaults
        }
    }

    /// Create a builder for configuration.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    pub fn models_dir(&self) -> PathBuf {
        paths::models_dir(&self.data_dir)
    }

    pub fn catalog_path(&self) -> PathBuf {
        paths::catalog_path(&self.models_dir())
    }

    pub fn selection_path(&self) -> PathBuf {
        paths::selection_path(&self.data_dir)
    }
}

/// Builder for runtime configuration.
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
    server_binary_set: bool,
}

impl RuntimeConfigBuilder {
    /// Also moves the default server binary under the new directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        if !self.server_binary_set {
            self.config.server_binary = paths::llama_server_path(&self.config.data_dir);
        }
        self
    }

    pub fn server_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.server_binary = path.into();
        self.server_binary_set = true;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn context_length(mut self, tokens: u32) -> Self {
        self.config.context_length = tokens;
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.max_tokens = tokens;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn history_limit(mut self, turns: usize) -> Self {
        self.config.history_limit = turns;
        self
    }

    pub fn preferred_model(mut self, model_id: impl Into<String>) -> Self {
        self.config.preferred_model = Some(model_id.into());
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.config.health_interval = interval;
        self
    }

    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_idle_timeout = timeout;
        self
    }

    pub fn download_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_idle_timeout = timeout;
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.config.progress_interval = interval;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.context_length, 8192);
        assert_eq!(config.history_limit, 20);
        assert!(config.system_prompt.starts_with("You are Eigen"));
        assert!(config.port.is_none());
        assert!(config.server_binary.starts_with(&config.data_dir));
    }

    #[test]
    fn test_from_env_values() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("EIGEN_DATA_DIR", "/srv/eigen"),
            ("EIGEN_PORT", "8080"),
            ("EIGEN_CTX_SIZE", "4096"),
            ("EIGEN_MAX_TOKENS", "512"),
            ("EIGEN_SYSTEM_PROMPT", "Be terse."),
            ("EIGEN_STARTUP_TIMEOUT_SECS", "30"),
            ("EIGEN_MODEL", "qwen3-4b"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/srv/eigen"));
        assert_eq!(
            config.server_binary,
            paths::llama_server_path(&PathBuf::from("/srv/eigen"))
        );
        assert_eq!(config.port, Some(8080));
        assert_eq!(config.context_length, 4096);
        assert_eq!(config.max_tokens, 512);
        assert_eq!(config.system_prompt, "Be terse.");
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.preferred_model.as_deref(), Some("qwen3-4b"));
    }

    #[test]
    fn test_from_env_ignores_garbage() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("EIGEN_PORT", "99999"),
            ("EIGEN_CTX_SIZE", "lots"),
            ("EIGEN_SYSTEM_PROMPT", "   "),
        ]));
        assert!(config.port.is_none());
        assert_eq!(config.context_length, 8192);
        assert_eq!(config.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .data_dir("/data")
            .port(9000)
            .max_tokens(64)
            .history_limit(4)
            .build();
        assert_eq!(config.models_dir(), PathBuf::from("/data/models"));
        assert_eq!(config.selection_path(), PathBuf::from("/data/selection.json"));
        assert_eq!(config.server_binary, paths::llama_server_path(&PathBuf::from("/data")));
        assert_eq!(config.port, Some(9000));
        assert_eq!(config.max_tokens, 64);
        assert_eq!(config.history_limit, 4);

        let config = RuntimeConfig::builder()
            .server_binary("/usr/bin/llama-server")
            .data_dir("/data")
            .build();
        assert_eq!(config.server_binary, PathBuf::from("/usr/bin/llama-server"));
    }
}

use std::path::PathBuf;

/// Server settings, read once from `STAYBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Prometheus exporter port; `None` disables it.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "staybook".into(),
            max_connections: 256,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|s| s.trim().parse().ok());
        Self {
            bind: lookup("STAYBOOK_BIND").unwrap_or(defaults.bind),
            port: number("STAYBOOK_PORT").unwrap_or(defaults.port),
            data_dir: lookup("STAYBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("STAYBOOK_PASSWORD").unwrap_or(defaults.password),
            max_connections: lookup("STAYBOOK_MAX_CONNECTIONS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.max_connections),
            metrics_port: number("STAYBOOK_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("staybook.wal")
    }
}

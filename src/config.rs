//! Server configuration.
//!
//! The configuration is loaded externally (the launcher reads TOML) and
//! handed to the core as a structured value. Every numeric field is range
//! checked by [`ServerConfig::validate`]; a value outside its documented
//! range fails with the offending field and value rather than being clamped.

use serde::Deserialize;

use crate::pool::ClassConfig;

/// Groups of SMB1 dialects that may be enabled together.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectGroup {
    /// `PC NETWORK PROGRAM 1.0` and friends.
    Core,
    /// `LANMAN1.0`, `LM1.2X002`, `LANMAN2.1`.
    Lanman,
    /// `NT LM 0.12`.
    Nt,
    /// Everything above.
    Smb1,
}

/// Raised when a configuration value is outside its permitted range.
#[derive(Debug, PartialEq, Eq)]
pub struct InvalidConfiguration {
    pub field: &'static str,
    pub value: String,
}

impl std::fmt::Display for InvalidConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration field {} has invalid value {}", self.field, self.value)
    }
}

impl std::error::Error for InvalidConfiguration {}

fn default_dialects() -> Vec<DialectGroup> {
    vec![DialectGroup::Smb1]
}

fn default_workers_initial() -> usize {
    25
}

fn default_workers_maximum() -> usize {
    50
}

fn default_max_virtual_circuits() -> u8 {
    4
}

fn default_max_packets_per_run() -> u8 {
    4
}

fn default_oplock_break_timeout_secs() -> u64 {
    35
}

fn default_transaction_stale_secs() -> u64 {
    60
}

fn default_buffer_wait_millis() -> u64 {
    5_000
}

fn default_state_cache_ttl_secs() -> u64 {
    30
}

fn default_worker_idle_secs() -> u64 {
    300
}

/// Per-class memory pool entry as it appears in configuration files.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MemoryClass {
    pub size: usize,
    pub initial: usize,
    pub maximum: usize,
}

/// The core configuration surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// NetBIOS-style server name, 1 to 15 characters.
    pub server_name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_dialects")]
    pub dialects: Vec<DialectGroup>,
    /// Adapter name or literal IP to bind; `None` binds every interface.
    #[serde(default)]
    pub bind_address: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Socket read timeout in seconds; 0 disables it. At most one hour.
    #[serde(default)]
    pub session_timeout_secs: u64,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub socket_recv_buffer: Option<usize>,
    #[serde(default)]
    pub socket_send_buffer: Option<usize>,
    #[serde(default = "default_workers_initial")]
    pub workers_initial: usize,
    #[serde(default = "default_workers_maximum")]
    pub workers_maximum: usize,
    #[serde(default = "default_worker_idle_secs")]
    pub worker_idle_secs: u64,
    #[serde(default)]
    pub memory_classes: Option<Vec<MemoryClass>>,
    #[serde(default = "default_max_virtual_circuits")]
    pub max_virtual_circuits: u8,
    #[serde(default = "default_max_packets_per_run")]
    pub max_packets_per_run: u8,
    #[serde(default = "default_oplock_break_timeout_secs")]
    pub oplock_break_timeout_secs: u64,
    #[serde(default = "default_transaction_stale_secs")]
    pub transaction_stale_secs: u64,
    #[serde(default = "default_buffer_wait_millis")]
    pub buffer_wait_millis: u64,
    #[serde(default = "default_state_cache_ttl_secs")]
    pub state_cache_ttl_secs: u64,
    /// Per-session debug topics, matched against `tracing` targets.
    #[serde(default)]
    pub debug_flags: Vec<String>,
}

impl ServerConfig {
    /// A minimal valid configuration for the given server name.
    pub fn with_name(server_name: &str) -> ServerConfig {
        ServerConfig {
            server_name: server_name.to_string(),
            domain: String::new(),
            dialects: default_dialects(),
            bind_address: None,
            aliases: Vec::new(),
            session_timeout_secs: 0,
            keep_alive: false,
            socket_recv_buffer: None,
            socket_send_buffer: None,
            workers_initial: default_workers_initial(),
            workers_maximum: default_workers_maximum(),
            worker_idle_secs: default_worker_idle_secs(),
            memory_classes: None,
            max_virtual_circuits: default_max_virtual_circuits(),
            max_packets_per_run: default_max_packets_per_run(),
            oplock_break_timeout_secs: default_oplock_break_timeout_secs(),
            transaction_stale_secs: default_transaction_stale_secs(),
            buffer_wait_millis: default_buffer_wait_millis(),
            state_cache_ttl_secs: default_state_cache_ttl_secs(),
            debug_flags: Vec::new(),
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(text: &str) -> Result<ServerConfig, Box<dyn std::error::Error + Send + Sync>> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks every numeric field.
    pub fn validate(&self) -> Result<(), InvalidConfiguration> {
        fn bad(field: &'static str, value: impl ToString) -> InvalidConfiguration {
            InvalidConfiguration { field, value: value.to_string() }
        }

        if self.server_name.is_empty() || self.server_name.len() > 15 {
            return Err(bad("server_name", &self.server_name));
        }
        if self.dialects.is_empty() {
            return Err(bad("dialects", "[]"));
        }
        if self.session_timeout_secs > 3600 {
            return Err(bad("session_timeout_secs", self.session_timeout_secs));
        }
        if !(8..=500).contains(&self.workers_initial) {
            return Err(bad("workers_initial", self.workers_initial));
        }
        if self.workers_maximum < self.workers_initial || self.workers_maximum > 500 {
            return Err(bad("workers_maximum", self.workers_maximum));
        }
        if !(1..=16).contains(&self.max_virtual_circuits) {
            return Err(bad("max_virtual_circuits", self.max_virtual_circuits));
        }
        if !(1..=16).contains(&self.max_packets_per_run) {
            return Err(bad("max_packets_per_run", self.max_packets_per_run));
        }
        if self.oplock_break_timeout_secs == 0 || self.oplock_break_timeout_secs > 600 {
            return Err(bad("oplock_break_timeout_secs", self.oplock_break_timeout_secs));
        }
        if let Some(classes) = &self.memory_classes {
            for class in classes {
                if class.size == 0 {
                    return Err(bad("memory_classes.size", class.size));
                }
                if !(5..=20).contains(&class.initial) {
                    return Err(bad("memory_classes.initial", class.initial));
                }
                if !(50..=100).contains(&class.maximum) {
                    return Err(bad("memory_classes.maximum", class.maximum));
                }
            }
        }
        Ok(())
    }

    /// Whether the given dialect group is enabled.
    pub fn dialect_enabled(&self, group: DialectGroup) -> bool {
        self.dialects.contains(&DialectGroup::Smb1) || self.dialects.contains(&group)
    }

    /// The memory pool class table, configured or default.
    pub fn pool_classes(&self) -> Vec<ClassConfig> {
        match &self.memory_classes {
            Some(classes) => classes
                .iter()
                .map(|c| ClassConfig { size: c.size, initial: c.initial, maximum: c.maximum })
                .collect(),
            None => crate::pool::default_classes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml() {
        let config = ServerConfig::from_toml(r#"server_name = "TESTSRV""#).unwrap();
        assert_eq!(config.server_name, "TESTSRV");
        assert_eq!(config.max_packets_per_run, 4);
        assert!(config.dialect_enabled(DialectGroup::Nt));
        assert!(config.dialect_enabled(DialectGroup::Core));
    }

    #[test]
    fn full_toml() {
        let config = ServerConfig::from_toml(
            r#"
            server_name = "FS01"
            domain = "WORKGROUP"
            dialects = ["nt"]
            aliases = ["FS", "FILES"]
            session_timeout_secs = 600
            workers_initial = 8
            workers_maximum = 16
            max_virtual_circuits = 2

            [[memory_classes]]
            size = 512
            initial = 5
            maximum = 50
            "#,
        )
        .unwrap();
        assert!(config.dialect_enabled(DialectGroup::Nt));
        assert!(!config.dialect_enabled(DialectGroup::Core));
        assert_eq!(config.pool_classes()[0].size, 512);
    }

    #[test]
    fn server_name_length_is_enforced() {
        let mut config = ServerConfig::with_name("ANAMEWAYTOOLONGFORNETBIOS");
        assert_eq!(config.validate().unwrap_err().field, "server_name");
        config.server_name = String::new();
        assert_eq!(config.validate().unwrap_err().field, "server_name");
    }

    #[test]
    fn out_of_range_values_name_the_field() {
        let mut config = ServerConfig::with_name("SRV");
        config.max_packets_per_run = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "max_packets_per_run");
        assert_eq!(err.value, "0");

        let mut config = ServerConfig::with_name("SRV");
        config.workers_initial = 4;
        assert_eq!(config.validate().unwrap_err().field, "workers_initial");

        let mut config = ServerConfig::with_name("SRV");
        config.max_virtual_circuits = 17;
        assert_eq!(config.validate().unwrap_err().field, "max_virtual_circuits");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(ServerConfig::from_toml(r#"server_name = "S"
mystery = 1"#).is_err());
    }
}

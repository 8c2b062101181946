use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}

/// Address the WebSocket gateway binds to.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    FailFast,
    Block,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestRecoveryMode {
    TimeOut,
    Rearm,
}

/// Broker tuning. Durations are plain integers in the unit their name
/// carries so they can be set from the environment.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_payload_bytes: usize,
    pub queue_capacity: usize,
    pub priority_weights: Vec<u32>,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub jitter: f64,
    pub attempt_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    pub idempotency_retention_secs: u64,
    pub message_ttl_secs: u64,
    pub request_timeout_ms: u64,
    pub backpressure: BackpressureMode,
    pub block_max_wait_ms: u64,
    pub pending_request_recovery: RequestRecoveryMode,
    pub supported_versions: Vec<String>,
    pub tick_interval_ms: u64,
    pub reaper_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub path: String,
    /// Use a throwaway database instead of `path`.
    pub temporary: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_payload_bytes: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub priority_weights: Option<Vec<u32>>,
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_ms: Option<u64>,
    pub jitter: Option<f64>,
    pub attempt_timeout_ms: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    pub idempotency_retention_secs: Option<u64>,
    pub message_ttl_secs: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub backpressure: Option<BackpressureMode>,
    pub block_max_wait_ms: Option<u64>,
    pub pending_request_recovery: Option<RequestRecoveryMode>,
    pub supported_versions: Option<Vec<String>>,
    pub tick_interval_ms: Option<u64>,
    pub reaper_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
    pub temporary: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            server: self.server.unwrap_or_default().merge(default.server),
            broker: self.broker.unwrap_or_default().merge(default.broker),
            storage: self.storage.unwrap_or_default().merge(default.storage),
            logging: self.logging.unwrap_or_default().merge(default.logging),
        }
    }
}

impl PartialServerSettings {
    fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
        }
    }
}

impl PartialBrokerSettings {
    fn merge(self, d: BrokerSettings) -> BrokerSettings {
        BrokerSettings {
            max_payload_bytes: self.max_payload_bytes.unwrap_or(d.max_payload_bytes),
            queue_capacity: self.queue_capacity.unwrap_or(d.queue_capacity),
            priority_weights: self.priority_weights.unwrap_or(d.priority_weights),
            max_attempts: self.max_attempts.unwrap_or(d.max_attempts),
            backoff_base_ms: self.backoff_base_ms.unwrap_or(d.backoff_base_ms),
            backoff_cap_ms: self.backoff_cap_ms.unwrap_or(d.backoff_cap_ms),
            jitter: self.jitter.unwrap_or(d.jitter),
            attempt_timeout_ms: self.attempt_timeout_ms.unwrap_or(d.attempt_timeout_ms),
            ack_timeout_ms: self.ack_timeout_ms.unwrap_or(d.ack_timeout_ms),
            idempotency_retention_secs: self
                .idempotency_retention_secs
                .unwrap_or(d.idempotency_retention_secs),
            message_ttl_secs: self.message_ttl_secs.unwrap_or(d.message_ttl_secs),
            request_timeout_ms: self.request_timeout_ms.unwrap_or(d.request_timeout_ms),
            backpressure: self.backpressure.unwrap_or(d.backpressure),
            block_max_wait_ms: self.block_max_wait_ms.unwrap_or(d.block_max_wait_ms),
            pending_request_recovery: self
                .pending_request_recovery
                .unwrap_or(d.pending_request_recovery),
            supported_versions: self.supported_versions.unwrap_or(d.supported_versions),
            tick_interval_ms: self.tick_interval_ms.unwrap_or(d.tick_interval_ms),
            reaper_interval_ms: self.reaper_interval_ms.unwrap_or(d.reaper_interval_ms),
        }
    }
}

impl PartialStorageSettings {
    fn merge(self, default: StorageSettings) -> StorageSettings {
        StorageSettings {
            path: self.path.unwrap_or(default.path),
            temporary: self.temporary.unwrap_or(default.temporary),
        }
    }
}

impl PartialLoggingSettings {
    fn merge(self, default: LoggingSettings) -> LoggingSettings {
        LoggingSettings {
            level: self.level.unwrap_or(default.level),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            broker: BrokerSettings {
                max_payload_bytes: 1024 * 1024,
                queue_capacity: 10_000,
                priority_weights: vec![8, 4, 2, 1],
                max_attempts: 5,
                backoff_base_ms: 500,
                backoff_cap_ms: 30_000,
                jitter: 0.2,
                attempt_timeout_ms: 5_000,
                ack_timeout_ms: 5_000,
                idempotency_retention_secs: 3600,
                message_ttl_secs: 3600,
                request_timeout_ms: 30_000,
                backpressure: BackpressureMode::FailFast,
                block_max_wait_ms: 1_000,
                pending_request_recovery: RequestRecoveryMode::TimeOut,
                supported_versions: vec!["1.0".into(), "1.1".into(), "2.0".into()],
                tick_interval_ms: 50,
                reaper_interval_ms: 1_000,
            },
            storage: StorageSettings {
                path: "agentbus_db".to_string(),
                temporary: false,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

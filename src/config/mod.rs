pub mod settings;

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};

use crate::broker::delivery::RetryPolicy;
use crate::broker::scheduler::BackpressurePolicy;
use crate::broker::session::ProtocolVersion;
use crate::broker::{BrokerConfig, PendingRequestRecovery};
use crate::utils::BrokerError;

use settings::PartialSettings;

pub use settings::{
    BackpressureMode, BrokerSettings, LoggingSettings, RequestRecoveryMode, ServerSettings,
    Settings, StorageSettings,
};

/// Loads the configuration from the default file and environment variables
/// and merges it onto the defaults.
///
/// Environment keys look like `AGENTBUS__BROKER__QUEUE_CAPACITY`; list
/// values are comma separated. A `.env` file in the working directory is
/// read first when present.
pub fn load_config() -> Result<Settings, ConfigError> {
    dotenvy::dotenv().ok();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("AGENTBUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("broker.priority_weights")
                .with_list_parse_key("broker.supported_versions"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

impl BrokerSettings {
    /// Converts into the broker's typed configuration and validates it.
    pub fn to_broker_config(&self) -> Result<BrokerConfig, BrokerError> {
        let supported_versions = self
            .supported_versions
            .iter()
            .map(|v| v.parse::<ProtocolVersion>())
            .collect::<Result<Vec<_>, _>>()?;

        let backpressure = match self.backpressure {
            BackpressureMode::FailFast => BackpressurePolicy::FailFast,
            BackpressureMode::Block => BackpressurePolicy::Block {
                max_wait: Duration::from_millis(self.block_max_wait_ms),
            },
        };
        let pending_request_recovery = match self.pending_request_recovery {
            RequestRecoveryMode::TimeOut => PendingRequestRecovery::TimeOut,
            RequestRecoveryMode::Rearm => PendingRequestRecovery::Rearm,
        };

        let config = BrokerConfig {
            max_payload_bytes: self.max_payload_bytes,
            queue_capacity: self.queue_capacity,
            priority_weights: self.priority_weights.clone(),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base: Duration::from_millis(self.backoff_base_ms),
                cap: Duration::from_millis(self.backoff_cap_ms),
                jitter: self.jitter,
            },
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            idempotency_retention: Duration::from_secs(self.idempotency_retention_secs),
            default_ttl: Duration::from_secs(self.message_ttl_secs),
            default_request_timeout: Duration::from_millis(self.request_timeout_ms),
            backpressure,
            pending_request_recovery,
            supported_versions,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            reaper_interval: Duration::from_millis(self.reaper_interval_ms),
            ..BrokerConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests;

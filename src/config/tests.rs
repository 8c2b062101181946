use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::*;
use crate::broker::scheduler::BackpressurePolicy;
use crate::broker::session::ProtocolVersion;

/// Runs `f` with a fresh temporary directory as the working directory.
fn in_tempdir<T>(f: impl FnOnce(&Path) -> T) -> T {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");
    let out = f(tmp.path());
    env::set_current_dir(orig).expect("restore cwd");
    out
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.broker.queue_capacity, 10_000);
    assert_eq!(settings.broker.priority_weights, vec![8, 4, 2, 1]);
    assert_eq!(settings.broker.message_ttl_secs, 3600);
    assert_eq!(settings.broker.backpressure, BackpressureMode::FailFast);
    assert!(!settings.storage.temporary);
    assert_eq!(settings.logging.level, "info");
}

#[test]
#[serial]
fn load_config_without_sources_uses_defaults() {
    let cfg = in_tempdir(|_| load_config().expect("load_config failed"));
    assert_eq!(cfg, Settings::default());
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let cfg = in_tempdir(|_| {
        fs::create_dir_all("config").expect("create config dir");
        let toml = r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [broker]
            queue_capacity = 10
            backpressure = "block"
            block_max_wait_ms = 250
            pending_request_recovery = "rearm"

            [storage]
            path = "/var/lib/agentbus"
        "#;
        fs::write("config/default.toml", toml).expect("write config file");
        load_config().expect("load_config failed")
    });

    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.broker.queue_capacity, 10);
    assert_eq!(cfg.broker.backpressure, BackpressureMode::Block);
    assert_eq!(cfg.broker.block_max_wait_ms, 250);
    assert_eq!(cfg.broker.pending_request_recovery, RequestRecoveryMode::Rearm);
    assert_eq!(cfg.storage.path, "/var/lib/agentbus");
    // untouched keys keep their defaults
    assert_eq!(cfg.broker.max_attempts, 5);
    assert_eq!(cfg.logging.level, "info");
}

#[test]
#[serial]
fn environment_overrides_file() {
    let cfg = temp_env::with_vars(
        [
            ("AGENTBUS__SERVER__PORT", Some("9100")),
            ("AGENTBUS__BROKER__PRIORITY_WEIGHTS", Some("4,3,2,1")),
            ("AGENTBUS__BROKER__SUPPORTED_VERSIONS", Some("1.1,2.0")),
            ("AGENTBUS__LOGGING__LEVEL", Some("debug")),
        ],
        || {
            in_tempdir(|_| {
                fs::create_dir_all("config").expect("create config dir");
                fs::write("config/default.toml", "[server]\nport = 9000\n")
                    .expect("write config file");
                load_config().expect("load_config failed")
            })
        },
    );

    assert_eq!(cfg.server.port, 9100);
    assert_eq!(cfg.broker.priority_weights, vec![4, 3, 2, 1]);
    assert_eq!(cfg.broker.supported_versions, vec!["1.1", "2.0"]);
    assert_eq!(cfg.logging.level, "debug");
}

#[test]
#[serial]
fn dotenv_file_is_read() {
    let cfg = temp_env::with_var_unset("AGENTBUS__STORAGE__TEMPORARY", || {
        in_tempdir(|_| {
            fs::write(".env", "AGENTBUS__STORAGE__TEMPORARY=true\n").expect("write .env");
            load_config().expect("load_config failed")
        })
    });
    assert!(cfg.storage.temporary);
}

#[test]
fn broker_settings_convert_to_typed_config() {
    let mut settings = Settings::default().broker;
    settings.backpressure = BackpressureMode::Block;
    settings.block_max_wait_ms = 300;
    settings.supported_versions = vec!["2.0".into(), "1.0".into()];

    let config = settings.to_broker_config().expect("valid settings");
    assert_eq!(
        config.backpressure,
        BackpressurePolicy::Block {
            max_wait: Duration::from_millis(300)
        }
    );
    assert_eq!(
        config.supported_versions,
        vec![ProtocolVersion::V2_0, ProtocolVersion::V1_0]
    );
    assert_eq!(config.retry.base, Duration::from_millis(500));
    assert_eq!(config.default_request_timeout, Duration::from_secs(30));
}

#[test]
fn invalid_broker_settings_are_rejected() {
    let mut settings = Settings::default().broker;
    settings.supported_versions = vec!["two".into()];
    assert!(settings.to_broker_config().is_err());

    let mut settings = Settings::default().broker;
    settings.queue_capacity = 0;
    assert!(matches!(
        settings.to_broker_config(),
        Err(BrokerError::Config(_))
    ));
}

use std::fs;
use std::path::PathBuf;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::Settings;
use super::{PartialSettings, load_config_from};

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.address, "localhost:61613");
    assert_eq!(settings.broker.login, None);
    assert!(!settings.tls.enabled);
    assert_eq!(
        settings.tls.ca_path,
        Some(PathBuf::from("/etc/grid-security/certificates"))
    );
    assert!(settings.reconnect.enabled);
    assert_eq!(settings.reconnect.delay_ms, 1000);
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn test_empty_partial_merges_to_defaults() {
    assert_eq!(Settings::merge(PartialSettings::default()), Settings::default());
}

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("stompsub.toml");
    fs::write(&path, contents).expect("write config file");
    path
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    let dir = TempDir::new().expect("create tempdir");
    let path = write_config(
        &dir,
        r#"
            [broker]
            address = "mq.example.org:61614"
            login = "fts"
            passcode = "secret"

            [tls]
            enabled = true
            cert = "/tmp/usercert.pem"

            [reconnect]
            delay_ms = 250
        "#,
    );

    let settings = load_config_from(&path).expect("load_config_from failed");
    assert_eq!(settings.broker.address, "mq.example.org:61614");
    assert_eq!(settings.broker.login.as_deref(), Some("fts"));
    assert_eq!(settings.broker.passcode.as_deref(), Some("secret"));
    assert!(settings.tls.enabled);
    assert!(!settings.tls.insecure);
    assert_eq!(settings.tls.cert, Some(PathBuf::from("/tmp/usercert.pem")));
    assert_eq!(
        settings.tls.ca_path,
        Some(PathBuf::from("/etc/grid-security/certificates"))
    );
    assert_eq!(settings.reconnect.delay_ms, 250);
    assert!(settings.reconnect.enabled);
    assert_eq!(settings.logging.level, "info");
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let dir = TempDir::new().expect("create tempdir");
    let path = write_config(
        &dir,
        r#"
            [broker]
            address = "from-file:61613"
            client_id = "file-client"
        "#,
    );

    temp_env::with_vars(
        [
            ("STOMPSUB__BROKER__ADDRESS", Some("from-env:61613")),
            ("STOMPSUB__RECONNECT__ENABLED", Some("false")),
            ("STOMPSUB__LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let settings = load_config_from(&path).expect("load_config_from failed");
            assert_eq!(settings.broker.address, "from-env:61613");
            assert_eq!(settings.broker.client_id.as_deref(), Some("file-client"));
            assert!(!settings.reconnect.enabled);
            assert_eq!(settings.logging.level, "debug");
        },
    );
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    let dir = TempDir::new().expect("create tempdir");
    assert!(load_config_from(dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_connection_parameters_follow_settings() {
    let mut settings = Settings::default();
    settings.broker.address = "mq.example.org:61613".to_string();
    settings.broker.login = Some("fts".to_string());
    settings.broker.passcode = Some("secret".to_string());
    settings.tls.enabled = true;
    settings.tls.insecure = true;

    let params = settings.connection_parameters();
    assert_eq!(params.address, "mq.example.org:61613");
    assert_eq!(params.login.as_deref(), Some("fts"));
    let tls = params.tls.as_ref().expect("tls settings");
    assert!(tls.insecure);
    assert_eq!(tls.ca_path, settings.tls.ca_path);
    assert!(params.on_connection_lost.is_some());

    settings.tls.enabled = false;
    settings.reconnect.enabled = false;
    let params = settings.connection_parameters();
    assert!(params.tls.is_none());
    assert!(params.on_connection_lost.is_none());
}

//! Config loading from disk and validation of the target inventory.

use std::io::Write;

use wpheal::config::Config;
use wpheal::model::{DiagnosisProfile, HealingMode, RetryStrategy};
use wpheal::HealerError;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_from_file() {
    let file = write_config(
        r#"
        [retry]
        circuit_reset_secs = 900

        [verification]
        pass_threshold = 70

        [[targets]]
        id = "blog"
        domain = "blog.example.com"
        path = "/srv/blog"

        [[targets.subdomains]]
        domain = "shop.blog.example.com"
        path = "/srv/blog-shop"
        "#,
    );

    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.retry.circuit_reset_secs, 900);
    assert_eq!(config.verification.pass_threshold, 70);
    assert_eq!(config.diagnosis.default_profile, DiagnosisProfile::Light);
    assert_eq!(config.healing.diagnosis_profile, DiagnosisProfile::Full);
    assert_eq!(config.diagnosis.log_window_secs, 3600);

    let blog = config.target("blog").unwrap().to_target();
    assert_eq!(blog.subdomains.len(), 1);
    assert_eq!(blog.healing.mode, HealingMode::Supervised);
    assert_eq!(blog.healing.max_attempts, 3);
    assert_eq!(blog.healing.retry_strategy, RetryStrategy::Exponential);
    assert_eq!(blog.healing.retry_base_delay_ms, 60_000);
}

#[test]
fn test_load_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(Config::load(missing.to_str()).is_err());
}

#[test]
fn test_malformed_toml_fails() {
    let file = write_config("[worker\nconcurrency = ");
    let err = Config::load(file.path().to_str()).unwrap_err();
    assert!(err.to_string().contains("parse"));
}

#[test]
fn test_duplicate_target_ids_rejected() {
    let toml = r#"
        [[targets]]
        id = "a"
        domain = "a.example.com"
        path = "/srv/a"

        [[targets]]
        id = "a"
        domain = "b.example.com"
        path = "/srv/b"
    "#;
    let err = Config::from_toml_str(toml).unwrap_err();
    let healer = err.downcast_ref::<HealerError>().unwrap();
    assert!(matches!(healer, HealerError::Config(msg) if msg.contains("duplicate")));
}

#[test]
fn test_zero_max_attempts_rejected() {
    let toml = r#"
        [[targets]]
        id = "a"
        domain = "a.example.com"
        path = "/srv/a"

        [targets.healing]
        max_attempts = 0
    "#;
    assert!(Config::from_toml_str(toml).is_err());
}

#[test]
fn test_unknown_profile_override_rejected() {
    let toml = r#"
        [profiles.deep]
        timeout_secs = 10
    "#;
    assert!(Config::from_toml_str(toml).is_err());
}

#[test]
fn test_unknown_mode_rejected() {
    let toml = r#"
        [[targets]]
        id = "a"
        domain = "a.example.com"
        path = "/srv/a"

        [targets.healing]
        mode = "yolo"
    "#;
    assert!(Config::from_toml_str(toml).is_err());
}

#[test]
fn test_zero_diagnosis_log_window_rejected() {
    let toml = r#"
        [diagnosis]
        log_window_secs = 0
    "#;
    let err = Config::from_toml_str(toml).unwrap_err();
    assert!(err.to_string().contains("log_window_secs"));
}

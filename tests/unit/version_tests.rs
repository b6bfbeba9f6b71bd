//! Unit tests for protocol revision negotiation.

use datagate::config::{ProtocolConfig, DEFAULT_VERSION, SUPPORTED_VERSIONS};
use datagate::mcp::version::VersionPolicy;
use datagate::AppError;

#[test]
fn default_revision_is_2025_03_26() {
    assert_eq!(DEFAULT_VERSION, "2025-03-26");
    let policy = VersionPolicy::new(&ProtocolConfig::default());
    assert_eq!(policy.default_version(), DEFAULT_VERSION);
    assert_eq!(policy.resolve(None).expect("default"), DEFAULT_VERSION);
}

#[test]
fn every_supported_revision_is_echoed() {
    let policy = VersionPolicy::new(&ProtocolConfig::default());
    for version in SUPPORTED_VERSIONS {
        assert_eq!(policy.resolve(Some(version)).expect("supported"), *version);
    }
}

#[test]
fn unknown_revision_is_rejected() {
    let policy = VersionPolicy::new(&ProtocolConfig::default());
    let err = policy.resolve(Some("1999-01-01")).expect_err("unsupported");
    assert!(matches!(err, AppError::UnsupportedVersion(_)));
    assert_eq!(err.code(), -32_001);
    assert_eq!(err.http_status(), 400);
}

#[test]
fn configured_list_replaces_builtin_list() {
    let policy = VersionPolicy::new(&ProtocolConfig {
        default_version: "2025-06-18".into(),
        supported_versions: vec!["2025-06-18".into()],
    });
    assert!(policy.resolve(Some("2025-03-26")).is_err());
    assert_eq!(policy.resolve(None).expect("default"), "2025-06-18");
}

//! Unit tests for the `Origin` allow-list.

use datagate::mcp::origin::OriginPolicy;
use datagate::AppError;

fn loopback_policy() -> OriginPolicy {
    let entries: Vec<String> = [
        "http://localhost",
        "http://127.0.0.1",
        "http://[::1]",
        "https://localhost",
        "https://127.0.0.1",
        "https://[::1]",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect();
    OriginPolicy::new(&entries)
}

#[test]
fn absent_origin_is_allowed() {
    assert!(loopback_policy().check(None).is_ok());
}

#[test]
fn loopback_origins_are_allowed_on_any_port() {
    let policy = loopback_policy();
    for origin in [
        "http://localhost",
        "http://localhost:3000",
        "http://127.0.0.1:8765",
        "https://127.0.0.1",
        "http://[::1]:9000",
        "HTTP://LOCALHOST:3000",
    ] {
        assert!(policy.check(Some(origin)).is_ok(), "{origin} should pass");
    }
}

#[test]
fn prefix_tricks_are_rejected() {
    let policy = loopback_policy();
    for origin in [
        "http://localhost.evil.example",
        "http://127.0.0.1.nip.io",
        "http://evil.example/http://localhost",
        "http://localhost@evil.example",
    ] {
        let err = policy.check(Some(origin)).expect_err("must reject");
        assert!(matches!(err, AppError::UnauthorizedOrigin(_)), "{origin}");
    }
}

#[test]
fn foreign_and_opaque_origins_are_rejected() {
    let policy = loopback_policy();
    assert!(policy.check(Some("http://evil.example")).is_err());
    assert!(policy.check(Some("null")).is_err());
    assert!(policy.check(Some("ftp://localhost")).is_err());
    assert!(policy.check(Some("")).is_err());
}

#[test]
fn entry_with_port_admits_only_that_port() {
    let policy = OriginPolicy::new(&["http://localhost:9000".to_owned()]);
    assert!(policy.check(Some("http://localhost:9000")).is_ok());
    assert!(policy.check(Some("http://localhost:9001")).is_err());
    assert!(policy.check(Some("http://localhost")).is_err());
}

#[test]
fn malformed_entries_are_ignored() {
    let policy = OriginPolicy::new(&["not an origin".to_owned(), "http://127.0.0.1".to_owned()]);
    assert!(policy.check(Some("http://127.0.0.1:1234")).is_ok());
    assert!(policy.check(Some("not an origin")).is_err());
}

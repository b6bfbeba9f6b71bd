use datagate::config::{GlobalConfig, Saturation};
use datagate::AppError;

fn root() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}

fn sample_toml(data_root: &str) -> String {
    format!(
        r#"
data_root = '{data_root}'

[http]
host = "localhost"
port = 9100
path = "/rpc"

[protocol]
default_version = "2025-06-18"
supported_versions = ["2025-06-18", "2025-03-26"]

[security]
allowed_origins = ["http://localhost:3000"]

[cache]
max_entries = 32
max_bytes = 4096

[pool]
workers = 2
queue_depth = 4
saturation = "reject"
queue_timeout_seconds = 5

[sessions]
idle_timeout_seconds = 60
reap_interval_seconds = 10
event_retention = 128

[streaming]
inline_threshold_bytes = 1024
chunk_items = 10

[stdio]
max_inflight = 4
"#
    )
}

#[test]
fn parses_every_section() {
    let dir = root();
    let config =
        GlobalConfig::from_toml_str(&sample_toml(&dir.path().display().to_string())).expect("parse");

    assert_eq!(config.data_root, dir.path().canonicalize().expect("canonical"));
    assert_eq!(config.http.host, "localhost");
    assert_eq!(config.http.port, 9100);
    assert_eq!(config.http.path, "/rpc");
    assert_eq!(config.protocol.default_version, "2025-06-18");
    assert_eq!(config.protocol.supported_versions.len(), 2);
    assert_eq!(config.security.allowed_origins, vec!["http://localhost:3000"]);
    assert_eq!(config.cache.max_entries, 32);
    assert_eq!(config.cache.max_bytes, 4096);
    assert_eq!(config.pool.workers, 2);
    assert_eq!(config.pool.queue_depth, 4);
    assert_eq!(config.pool.saturation, Saturation::Reject);
    assert_eq!(config.pool.queue_timeout_seconds, 5);
    assert_eq!(config.sessions.idle_timeout_seconds, 60);
    assert_eq!(config.sessions.event_retention, 128);
    assert_eq!(config.streaming.chunk_items, 10);
    assert_eq!(config.stdio.max_inflight, 4);
}

#[test]
fn defaults_apply_without_a_file() {
    let dir = root();
    let config = GlobalConfig::with_data_root(dir.path()).expect("defaults");

    assert_eq!(config.http.host, "127.0.0.1");
    assert_eq!(config.http.port, 8765);
    assert_eq!(config.http.path, "/mcp");
    assert!(!config.http.allow_remote);
    assert_eq!(config.protocol.default_version, "2025-03-26");
    assert!(config
        .protocol
        .supported_versions
        .iter()
        .any(|v| v == "2025-06-18"));
    assert_eq!(config.pool.saturation, Saturation::Block);
    assert!(config.pool.workers > 0);
}

#[test]
fn load_from_path_reads_file() {
    let dir = root();
    let file = dir.path().join("config.toml");
    std::fs::write(&file, sample_toml(&dir.path().display().to_string())).expect("write");

    let config = GlobalConfig::load_from_path(&file).expect("load");
    assert_eq!(config.http.port, 9100);
}

#[test]
fn missing_file_is_config_error() {
    let dir = root();
    let err = GlobalConfig::load_from_path(dir.path().join("absent.toml")).expect_err("missing");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn missing_data_root_is_rejected() {
    let dir = root();
    let err = GlobalConfig::with_data_root(dir.path().join("nope")).expect_err("missing root");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn zero_limits_are_rejected() {
    let dir = root();
    let base = dir.path().display().to_string();
    for section in [
        "[pool]\nworkers = 0",
        "[cache]\nmax_entries = 0",
        "[sessions]\nevent_retention = 0",
        "[streaming]\nchunk_items = 0",
        "[stdio]\nmax_inflight = 0",
    ] {
        let raw = format!("data_root = '{base}'\n{section}\n");
        let err = GlobalConfig::from_toml_str(&raw).expect_err(section);
        assert!(matches!(err, AppError::Config(_)), "{section}");
    }
}

#[test]
fn default_version_must_be_supported() {
    let dir = root();
    let raw = format!(
        "data_root = '{}'\n[protocol]\ndefault_version = \"2099-01-01\"\n",
        dir.path().display()
    );
    let err = GlobalConfig::from_toml_str(&raw).expect_err("unsupported default");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn endpoint_path_must_be_absolute() {
    let dir = root();
    let raw = format!("data_root = '{}'\n[http]\npath = \"mcp\"\n", dir.path().display());
    assert!(GlobalConfig::from_toml_str(&raw).is_err());
}

#[test]
fn invalid_toml_is_config_error() {
    let err = GlobalConfig::from_toml_str("data_root = [").expect_err("bad toml");
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn non_loopback_host_is_coerced_without_opt_in() {
    let dir = root();
    let mut config = GlobalConfig::with_data_root(dir.path()).expect("defaults");

    config.http.host = "0.0.0.0".into();
    assert_eq!(config.bind_host(), "127.0.0.1");

    config.http.allow_remote = true;
    assert_eq!(config.bind_host(), "0.0.0.0");

    config.http.allow_remote = false;
    config.http.host = "::1".into();
    assert_eq!(config.bind_host(), "::1");
}

// Config load and validation: defaults, sections, rejected values

use errorvault_agent::config::{
    ALLOWED_ALERT_COOLDOWNS, AppConfig, MemorySource, UploadMode,
};

const VALID_CONFIG: &str = r#"
[server]
port = 8088
host = "127.0.0.1"

[collector]
base_url = "https://vault.example.com/api/v1/errors"
api_token = "secret"
site_name = "Shop"
site_url = "https://shop.example"

[health]
enabled = true
alert_cooldown_secs = 300

[backup]
enabled = true
export_command = ["mysqldump", "shop"]
"#;

#[test]
fn load_from_str_valid_config_fills_defaults() {
    let config = AppConfig::load_from_str(VALID_CONFIG).expect("valid config should load");
    assert_eq!(config.server.port, 8088);
    assert!(config.collector.is_configured());
    assert_eq!(config.collector.notify_timeout_secs, 5);
    assert_eq!(config.collector.part_timeout_secs, 120);

    assert!(config.health.enabled);
    assert_eq!(config.health.cpu_load_threshold, 2.0);
    assert_eq!(config.health.memory_threshold, 80.0);
    assert_eq!(config.health.request_rate_threshold, 100);
    assert_eq!(config.health.request_spike_threshold, 3.0);
    assert_eq!(config.health.memory_source, MemorySource::System);

    assert_eq!(config.backup.chunk_size_bytes, 5 * 1024 * 1024);
    assert_eq!(config.backup.max_archive_bytes, 512_000 * 1024);
    assert_eq!(config.backup.max_part_retries, 3);
    assert_eq!(config.backup.lock_ttl_secs, 600);
    assert_eq!(config.backup.upload_mode, UploadMode::Chunked);
    assert!(config.backup.temp_dir().ends_with("tmp"));

    assert_eq!(config.errors.batch_size, 10);
    assert!(!config.errors.send_immediately);
    assert_eq!(config.connectivity.failure_threshold, 5);
    assert!(config.store.path.is_none());
    assert_eq!(config.store.prune_interval_secs, 3600);
}

#[test]
fn load_from_str_minimal_config_disables_features() {
    let config = AppConfig::load_from_str(
        r#"
[server]
port = 9000
host = "0.0.0.0"

[collector]
"#,
    )
    .expect("minimal config should load");
    assert!(!config.collector.is_configured());
    assert!(!config.health.enabled);
    assert!(!config.backup.enabled);
}

#[test]
fn load_from_str_rejects_port_zero() {
    let bad = VALID_CONFIG.replace("port = 8088", "port = 0");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("server.port"));
}

#[test]
fn load_from_str_rejects_unlisted_cooldown() {
    let bad = VALID_CONFIG.replace("alert_cooldown_secs = 300", "alert_cooldown_secs = 120");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("alert_cooldown_secs"));
}

#[test]
fn load_from_str_accepts_every_listed_cooldown() {
    for secs in ALLOWED_ALERT_COOLDOWNS {
        let cfg = VALID_CONFIG.replace(
            "alert_cooldown_secs = 300",
            &format!("alert_cooldown_secs = {}", secs),
        );
        let config = AppConfig::load_from_str(&cfg).expect("listed cooldown should load");
        assert_eq!(config.health.alert_cooldown_secs, secs);
    }
}

#[test]
fn load_from_str_rejects_memory_threshold_above_100() {
    let bad = VALID_CONFIG.replace("enabled = true\nalert", "enabled = true\nmemory_threshold = 150.0\nalert");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("memory_threshold"));
}

#[test]
fn load_from_str_process_memory_requires_pid() {
    let bad = VALID_CONFIG.replace(
        "alert_cooldown_secs = 300",
        "alert_cooldown_secs = 300\nmemory_source = \"process\"",
    );
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("watch_pid"));

    let ok = VALID_CONFIG.replace(
        "alert_cooldown_secs = 300",
        "alert_cooldown_secs = 300\nmemory_source = \"process\"\nwatch_pid = 1",
    );
    let config = AppConfig::load_from_str(&ok).expect("pid given");
    assert_eq!(config.health.memory_source, MemorySource::Process);
    assert_eq!(config.health.watch_pid, Some(1));
}

#[test]
fn load_from_str_enabled_backup_requires_export_command() {
    let bad = VALID_CONFIG.replace("export_command = [\"mysqldump\", \"shop\"]", "");
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("export_command"));
}

#[test]
fn load_from_str_rejects_zero_chunk_size() {
    let bad = VALID_CONFIG.replace(
        "export_command",
        "chunk_size_bytes = 0\nexport_command",
    );
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("chunk_size_bytes"));
}

#[test]
fn load_from_str_single_upload_mode() {
    let cfg = VALID_CONFIG.replace("export_command", "upload_mode = \"single\"\nexport_command");
    let config = AppConfig::load_from_str(&cfg).expect("single mode");
    assert_eq!(config.backup.upload_mode, UploadMode::Single);
}

#[test]
fn load_from_str_rejects_zero_batch_size() {
    let bad = format!("{}\n[errors]\nbatch_size = 0\n", VALID_CONFIG);
    let err = AppConfig::load_from_str(&bad).unwrap_err();
    assert!(err.to_string().contains("errors.batch_size"));
}

#[test]
fn load_from_str_rejects_malformed_toml() {
    assert!(AppConfig::load_from_str("[server\nport = ").is_err());
}

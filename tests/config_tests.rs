// ABOUTME: Tests that configuration files drive server initialization end to end
// ABOUTME: Verifies the search order env var, data directory layout, and rate limit wiring

use serial_test::serial;

use parley::config::Config;
use parley::paths;
use parley::server::AppState;

const ENV_VARS: [&str; 7] = [
    "PARLEY_CONFIG",
    "PARLEY_HOST",
    "PARLEY_PORT",
    "PARLEY_JWT_SECRET",
    "PARLEY_DATA_DIR",
    "PARLEY_RATE_LIMIT_ENABLED",
    "PARLEY_LOG_FORMAT",
];

fn clear_config_env_vars() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_config_env_path_drives_initialization() {
    clear_config_env_vars();
    let tmpdir = tempfile::tempdir().unwrap();
    let data_dir = tmpdir.path().join("data");
    let config_path = tmpdir.path().join("parley.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[server]
port = 14000

[auth]
jwt_secret = "config-test-secret"

[rate_limit]
enabled = false

[storage]
data_dir = "{}"

[websocket]
outbound_buffer = 8
"#,
            data_dir.display()
        ),
    )
    .unwrap();
    std::env::set_var("PARLEY_CONFIG", &config_path);

    let config = Config::load().unwrap();
    assert_eq!(config.server.port, 14000);
    assert_eq!(config.websocket.outbound_buffer, 8);

    let state = AppState::initialize(config, None).unwrap();
    assert!(!state.admission.is_enabled());
    assert_eq!(state.web.outbound_buffer(), 8);
    assert_eq!(state.channels.channel_types(), vec!["web"]);
    assert!(paths::sessions_db(&data_dir).exists());

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_invalid_config_file_fails_to_load() {
    clear_config_env_vars();
    let tmpdir = tempfile::tempdir().unwrap();
    let config_path = tmpdir.path().join("parley.toml");
    std::fs::write(&config_path, "[websocket]\noutbound_buffer = 0\n").unwrap();
    std::env::set_var("PARLEY_CONFIG", &config_path);

    let err = Config::load().unwrap_err();
    assert!(err.to_string().contains("outbound_buffer"));

    clear_config_env_vars();
}

#[test]
#[serial]
fn test_state_survives_reinitialization() {
    clear_config_env_vars();
    let tmpdir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = Some(tmpdir.path().display().to_string());
    config.auth.jwt_secret = Some("restart-secret".to_string());

    let first = AppState::initialize(config.clone(), None).unwrap();
    let active = first
        .conversations
        .resolve_active("web|alice|tab-1", "web", None)
        .unwrap();
    drop(first);

    let second = AppState::initialize(config, None).unwrap();
    let again = second
        .conversations
        .resolve_active("web|alice|tab-1", "web", None)
        .unwrap();
    assert_eq!(again.conversation_key, active.conversation_key);
    assert_eq!(again.source.as_str(), "pointer");
}

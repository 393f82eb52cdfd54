use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;
use wellness_coach::config::{ConfigError, ConfigLoader};

const SECRET: &str = "config-loader-test-secret-0123456789abcdef";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        for (key, _) in env::vars() {
            if key.starts_with("WELLNESS_") {
                env::remove_var(key);
            }
        }
        env::remove_var("NEXTAUTH_SECRET");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader_for(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_with_required_settings() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("WELLNESS_OPERATOR_TOKEN", "operator-token");
        env::set_var("WELLNESS_APP_SECRET", SECRET);
    }

    let cfg = loader_for(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.token_refresh_leeway_seconds, 60);
    assert_eq!(cfg.oauth_state_ttl_minutes, 15);
    assert_eq!(cfg.operator_tokens, vec!["operator-token".to_string()]);
    assert!(cfg.fitbit_scopes.contains(&"activity".to_string()));
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "WELLNESS_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "WELLNESS_API_BIND_ADDR=192.168.0.10:5000\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "WELLNESS_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // The profile is chosen in .env.local before profile-specific files load
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "WELLNESS_PROFILE=test\nWELLNESS_API_BIND_ADDR=127.0.0.1:4000\nWELLNESS_OPERATOR_TOKEN=layered\nWELLNESS_APP_SECRET={}\n",
            SECRET
        ),
    );

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!(
            "WELLNESS_API_BIND_ADDR=127.0.0.1:3000\nWELLNESS_OPERATOR_TOKEN=from-file\nWELLNESS_APP_SECRET={}\n",
            SECRET
        ),
    );

    unsafe {
        env::set_var("WELLNESS_API_BIND_ADDR", "0.0.0.0:9090");
    }

    let cfg = loader_for(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.operator_tokens, vec!["from-file".to_string()]);

    clear_env();
}

#[test]
fn nextauth_secret_is_used_as_fallback() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!("WELLNESS_OPERATOR_TOKEN=t\nNEXTAUTH_SECRET={}\n", SECRET),
    );

    let cfg = loader_for(&temp_dir).load().expect("config loads");
    assert_eq!(cfg.app_secret.as_deref(), Some(SECRET));

    // the prefixed secret wins when both exist
    let override_secret = "z".repeat(40);
    unsafe {
        env::set_var("WELLNESS_APP_SECRET", &override_secret);
    }
    let cfg = loader_for(&temp_dir).load().expect("config loads");
    assert_eq!(cfg.app_secret.as_deref(), Some(override_secret.as_str()));

    clear_env();
}

#[test]
fn missing_secret_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("WELLNESS_OPERATOR_TOKEN", "operator-token");
    }

    let err = loader_for(&temp_dir).load().expect_err("secret is required");
    assert!(matches!(err, ConfigError::MissingAppSecret));

    clear_env();
}

#[test]
fn provider_settings_and_lists_are_parsed() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        &format!(
            "WELLNESS_OPERATOR_TOKENS=one,two,\nWELLNESS_APP_SECRET={}\n\
             WELLNESS_FITBIT_CLIENT_ID=fitbit-id\nWELLNESS_FITBIT_CLIENT_SECRET=fitbit-secret\n\
             WELLNESS_FITBIT_SCOPES=activity,sleep\n\
             WELLNESS_GMAIL_REDIRECT_URI=https://api.example.com/custom/gmail\n",
            SECRET
        ),
    );

    let cfg = loader_for(&temp_dir).load().expect("config loads");
    assert_eq!(cfg.operator_tokens, vec!["one".to_string(), "two".to_string()]);
    assert!(cfg.fitbit.is_configured());
    assert!(!cfg.gmail.is_configured());
    assert_eq!(cfg.fitbit_scopes, vec!["activity".to_string(), "sleep".to_string()]);
    assert_eq!(
        cfg.redirect_uri_for("gmail"),
        "https://api.example.com/custom/gmail"
    );
    assert_eq!(
        cfg.redirect_uri_for("fitbit"),
        "http://localhost:8080/api/integrations/fitbit/callback"
    );

    let redacted = cfg.redacted_json().unwrap();
    assert!(!redacted.contains("fitbit-secret"));
    assert!(!redacted.contains(SECRET));

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("WELLNESS_API_BIND_ADDR", "not-an-addr");
        env::set_var("WELLNESS_OPERATOR_TOKEN", "operator-token");
        env::set_var("WELLNESS_APP_SECRET", SECRET);
    }

    let err = loader_for(&temp_dir)
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}

use std::io::Write;

use probe_engine::config::Config;
use probe_engine::config::settings::Settings;
use probe_engine::model::SearchEngine;

// Env vars are process-global, so every env case runs in one test.
#[test]
fn config_from_env() {
    unsafe {
        std::env::remove_var("PROBE_DATABASE_URL");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("PROBE_DATABASE_URL", "sqlite://probe.db");
        std::env::set_var("PROBE_SETTINGS", "/etc/probe/settings.toml");
        std::env::remove_var("LOG_LEVEL");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.database_url, "sqlite://probe.db");
    assert_eq!(config.log_level, "info");
    assert_eq!(
        config.settings_path.as_deref(),
        Some(std::path::Path::new("/etc/probe/settings.toml"))
    );

    // Clean up
    unsafe {
        std::env::remove_var("PROBE_DATABASE_URL");
        std::env::remove_var("PROBE_SETTINGS");
    }
}

#[test]
fn settings_load_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "delay_between_queries_ms = 250\nclose_resource_on_completion = false\nsearch_engine = \"duckduckgo\""
    )
    .unwrap();

    let settings = Settings::from_toml_file(file.path()).unwrap();
    assert_eq!(settings.delay_between_queries_ms, 250);
    assert!(!settings.close_resource_on_completion);
    assert_eq!(settings.search_engine, SearchEngine::Duckduckgo);
    assert_eq!(settings.queries_per_session, 10);
}

#[test]
fn settings_file_errors_are_config_errors() {
    let missing = Settings::from_toml_file(std::path::Path::new("/nonexistent/settings.toml"));
    assert!(matches!(missing, Err(probe_engine::error::Error::Config(_))));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "search_engine = \"altavista\"").unwrap();
    assert!(Settings::from_toml_file(file.path()).is_err());
}

use eval_store::settings::{load_settings, save_settings, PersistentSettings, RuntimePolicy, Telemetry};
use tempfile::TempDir;

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nonexistent.json");
    let settings = load_settings(&path);
    assert!(settings.strip_prompt_text.is_none());
    assert!(settings.default_author.is_none());
    assert!(settings.telemetry.is_none());
}

#[test]
fn test_load_invalid_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "not json at all {{{").unwrap();
    let settings = load_settings(&path);
    // Should return defaults instead of panicking
    assert!(settings.strip_prompt_text.is_none());
    assert!(settings.update_check.is_none());
}

#[test]
fn test_save_and_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    let settings = PersistentSettings {
        strip_prompt_text: Some(true),
        default_author: Some("ci@example.com".to_string()),
        telemetry: Some(false),
        update_check: Some(false),
    };

    save_settings(&path, &settings);
    let loaded = load_settings(&path);

    assert_eq!(loaded.strip_prompt_text, Some(true));
    assert_eq!(loaded.default_author, Some("ci@example.com".to_string()));
    assert_eq!(loaded.telemetry, Some(false));
}

#[test]
fn test_partial_settings_drive_policy() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("partial.json");
    std::fs::write(&path, r#"{"telemetry": true}"#).unwrap();

    let policy = RuntimePolicy::from_settings(&load_settings(&path));
    assert_eq!(policy.telemetry, Telemetry::LocalLog);
    assert!(!policy.strip_prompt_text);
    assert!(policy.default_author.is_none());
}

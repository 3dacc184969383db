//! Tests for the configuration management module

use rstest::rstest;
use slurm_resubmit::config::{
    ConfigPaths, LoggingConfig, MonitorConfig, PathsConfig, ResubmitConfig, WrapperConfig,
};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

// ============== Default Value Tests ==============

#[rstest]
fn test_monitor_config_defaults() {
    let config = MonitorConfig::default();
    assert_eq!(config.automated_source, "regression");
    assert!(config.trigger_source.is_empty());
    assert!(config.scheduler_configs.is_empty());
    assert_eq!(config.poll_interval_secs, 30.0);
    assert_eq!(config.poll_interval(), Duration::from_secs(30));
}

#[rstest]
fn test_paths_config_defaults() {
    let config = PathsConfig::default();
    assert_eq!(config.base_dir, PathBuf::from("."));
    assert_eq!(config.log_root, PathBuf::from("logs"));
}

#[rstest]
fn test_wrapper_and_logging_defaults() {
    let wrapper = WrapperConfig::default();
    assert_eq!(wrapper.executable, "run_bips");
    assert_eq!(wrapper.scheduler_kind, "slurm");

    let logging = LoggingConfig::default();
    assert_eq!(logging.log_level, "info");
    assert!(logging.log_file.is_none());
}

// ============== Config Paths Tests ==============

#[rstest]
fn test_config_paths_new() {
    let paths = ConfigPaths::new();
    assert_eq!(paths.system, PathBuf::from("/etc/bips/resubmit.toml"));
    assert_eq!(paths.local, PathBuf::from("bips-resubmit.toml"));
}

#[rstest]
fn test_config_paths_existing_paths_empty() {
    let paths = ConfigPaths {
        system: PathBuf::from("/nonexistent/system/resubmit.toml"),
        user: Some(PathBuf::from("/nonexistent/user/resubmit.toml")),
        local: PathBuf::from("/nonexistent/local/bips-resubmit.toml"),
    };
    assert!(paths.existing_paths().is_empty());

    let config = ResubmitConfig::load_with_paths(&paths).unwrap();
    assert_eq!(config.monitor.automated_source, "regression");
}

#[rstest]
fn test_config_paths_existing_paths_in_priority_order() {
    let temp_dir = TempDir::new().unwrap();
    let system = temp_dir.path().join("system.toml");
    let local = temp_dir.path().join("local.toml");
    fs::write(&system, "").unwrap();
    fs::write(&local, "").unwrap();

    let paths = ConfigPaths {
        system: system.clone(),
        user: None,
        local: local.clone(),
    };
    assert_eq!(paths.existing_paths(), vec![system, local]);
}

// ============== Config Loading Tests ==============

#[rstest]
fn test_load_from_toml_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("resubmit.toml");

    let toml_content = r#"
[monitor]
trigger_source = "regression"
scheduler_configs = ["/runs/a/slurm.ini"]
units = ["20240101", "20240102"]
poll_interval_secs = 2.5

[paths]
base_dir = "/runs/a"
log_root = "/runs/a/logs"

[wrapper]
executable = "/opt/bips/bin/run_bips"

[logging]
log_level = "debug"
log_file = "/tmp/resubmit.log"
"#;
    fs::write(&config_path, toml_content).unwrap();

    let config = ResubmitConfig::load_from_files(&[config_path]).unwrap();
    assert_eq!(config.monitor.trigger_source, "regression");
    assert_eq!(
        config.monitor.scheduler_configs,
        vec![PathBuf::from("/runs/a/slurm.ini")]
    );
    assert_eq!(config.monitor.units, vec!["20240101", "20240102"]);
    assert_eq!(config.monitor.poll_interval(), Duration::from_millis(2500));
    assert_eq!(config.paths.base_dir, PathBuf::from("/runs/a"));
    assert_eq!(config.wrapper.executable, "/opt/bips/bin/run_bips");
    // Unspecified values keep their defaults
    assert_eq!(config.wrapper.scheduler_kind, "slurm");
    assert_eq!(config.logging.log_level, "debug");
    assert_eq!(
        config.logging.log_file,
        Some(PathBuf::from("/tmp/resubmit.log"))
    );
}

#[rstest]
fn test_load_with_priority_order() {
    let temp_dir = TempDir::new().unwrap();
    let first = temp_dir.path().join("first.toml");
    let second = temp_dir.path().join("second.toml");

    fs::write(
        &first,
        "[monitor]\ntrigger_source = \"manual\"\npoll_interval_secs = 5.0\n",
    )
    .unwrap();
    fs::write(&second, "[monitor]\ntrigger_source = \"regression\"\n").unwrap();

    let config = ResubmitConfig::load_from_files(&[first, second]).unwrap();
    assert_eq!(config.monitor.trigger_source, "regression");
    // Keys absent from the later file survive from the earlier one
    assert_eq!(config.monitor.poll_interval_secs, 5.0);
}

#[rstest]
fn test_load_invalid_toml_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("broken.toml");
    fs::write(&config_path, "[monitor\ntrigger_source = ").unwrap();

    let err = ResubmitConfig::load_from_files(&[config_path]).unwrap_err();
    assert!(err.to_string().contains("broken.toml"));
}

#[rstest]
fn test_load_missing_file_is_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = ResubmitConfig::load_from_files(&[temp_dir.path().join("missing.toml")]);
    assert!(result.is_err());
}

// ============== Overrides and Validation ==============

#[rstest]
fn test_environment_overrides() {
    let mut config = ResubmitConfig::default();
    config.apply_overrides(vec![
        ("BIPS_TRIGGER_SOURCE".to_string(), "regression".to_string()),
        ("BIPS_BASE_DIR".to_string(), "/scratch/run".to_string()),
        ("BIPS_LOG_ROOT".to_string(), "/scratch/run/logs".to_string()),
        ("BIPS_LOG_LEVEL".to_string(), "trace".to_string()),
        ("HOME".to_string(), "/home/user".to_string()),
    ]);
    assert_eq!(config.monitor.trigger_source, "regression");
    assert_eq!(config.paths.base_dir, PathBuf::from("/scratch/run"));
    assert_eq!(config.paths.log_root, PathBuf::from("/scratch/run/logs"));
    assert_eq!(config.logging.log_level, "trace");
}

#[rstest]
fn test_validate_defaults() {
    assert!(ResubmitConfig::default().validate().is_ok());
}

#[rstest]
#[case::zero_interval("zero_interval")]
#[case::negative_interval("negative_interval")]
#[case::infinite_interval("infinite_interval")]
#[case::nan_interval("nan_interval")]
#[case::empty_automated_source("empty_automated_source")]
#[case::empty_executable("empty_executable")]
#[case::bad_log_level("bad_log_level")]
fn test_validate_rejects(#[case] problem: &str) {
    let mut config = ResubmitConfig::default();
    match problem {
        "zero_interval" => config.monitor.poll_interval_secs = 0.0,
        "negative_interval" => config.monitor.poll_interval_secs = -1.0,
        "infinite_interval" => config.monitor.poll_interval_secs = f64::INFINITY,
        "nan_interval" => config.monitor.poll_interval_secs = f64::NAN,
        "empty_automated_source" => config.monitor.automated_source = " ".to_string(),
        "empty_executable" => config.wrapper.executable = String::new(),
        "bad_log_level" => config.logging.log_level = "verbose".to_string(),
        _ => unreachable!(),
    }
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 1, "{:?}", errors);
}

#[rstest]
fn test_validate_collects_every_error() {
    let mut config = ResubmitConfig::default();
    config.monitor.poll_interval_secs = 0.0;
    config.wrapper.scheduler_kind = String::new();
    config.logging.log_level = "loud".to_string();
    assert_eq!(config.validate().unwrap_err().len(), 3);
}

// ============== Serialization ==============

#[rstest]
fn test_write_and_reload() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("resubmit.toml");

    let mut config = ResubmitConfig::default();
    config.monitor.trigger_source = "regression".to_string();
    config.monitor.units = vec!["20240102".to_string()];
    config.paths.base_dir = PathBuf::from("/runs/b");
    config.write_to(&path).unwrap();

    let reloaded = ResubmitConfig::load_from_files(&[path]).unwrap();
    assert_eq!(reloaded.monitor.trigger_source, "regression");
    assert_eq!(reloaded.monitor.units, vec!["20240102"]);
    assert_eq!(reloaded.paths.base_dir, PathBuf::from("/runs/b"));
}

//! Loading runtime configuration from TOML files and environment overrides.

use rust_automation::buffer::RollPolicy;
use rust_automation::config::RuntimeConfig;
use rust_automation::registry::ScheduleMode;
use rust_automation::units::Unit;
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
[application]
name = "Test Plant"

[scheduler]
default_interval_secs = 0.5
default_mode = "sync"

[[machines]]
name = "boiler"
buffer_size = 4
buffer_roll_policy = "forward"

[[tags]]
name = "PT-100"
unit = "bar"
display_unit = "kPa"
scan_time_ms = 250.0

[tags.remote]
address = "opc.tcp://plc:4840"
namespace = "ns=2;i=7"
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn loads_full_configuration() {
    let file = write_config(CONFIG);
    let config = RuntimeConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.name, "Test Plant");
    assert_eq!(config.application.log_level, "info");
    assert_eq!(config.scheduler.default_mode, ScheduleMode::Sync);
    assert_eq!(config.scheduler.worker_thread_name, "state-machine-worker");

    let boiler = &config.machines[0];
    assert_eq!(boiler.buffer_size, 4);
    assert_eq!(boiler.buffer_roll_policy, RollPolicy::Forward);
    assert_eq!(boiler.interval, 1.0);

    let tag = &config.tags[0];
    assert_eq!(tag.tag.name, "PT-100");
    assert_eq!(tag.tag.unit, Unit::Bar);
    assert_eq!(tag.tag.display_unit, Unit::Kilopascal);
    assert_eq!(tag.scan_time_ms, 250.0);
    assert_eq!(tag.tag.remote.as_ref().unwrap().namespace, "ns=2;i=7");
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = write_config(CONFIG);
    std::env::set_var("RUST_AUTOMATION_APPLICATION__LOG_LEVEL", "debug");
    let result = RuntimeConfig::load_from(file.path());
    std::env::remove_var("RUST_AUTOMATION_APPLICATION__LOG_LEVEL");

    assert_eq!(result.unwrap().application.log_level, "debug");
}

#[test]
#[serial]
fn invalid_values_fail_validation() {
    let file = write_config(
        r#"
[application]
name = "Bad"
log_level = "chatty"
"#,
    );
    let config = RuntimeConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn missing_application_section_is_an_error() {
    let file = write_config("[scheduler]\ndefault_interval_secs = 1.0\n");
    assert!(RuntimeConfig::load_from(file.path()).is_err());
}

#[test]
#[serial]
fn shipped_sample_configuration_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/automation.toml");
    let config = RuntimeConfig::load_from(path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.machines.len(), 2);
    assert_eq!(config.tags.len(), 2);
}

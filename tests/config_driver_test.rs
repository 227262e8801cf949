//! TOML driver declarations and application settings.

use daq_props::config::{DriverConfig, Settings};
use daq_props::prelude::*;
use daq_props::testing::{expected_protocol, Exchange};
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

const GENERATOR: &str = r#"
name = "Generator"
scpi = true

[error_check]
kind = "scpi_queue"

[[property]]
name = "frequency_khz"
get = "FREQ?"
set = "FREQ %g"
doc = "Output frequency in kHz"
validator = "strict_range"
values = [0.001, 50000]
set_process = "value * 1000"
get_process = "value / 1000"
dynamic = true

[[property]]
name = "shape"
get = "FUNC?"
set = "FUNC %s"
validator = "strict_discrete_set"
map = [["sine", "SIN"], ["square", "SQU"]]
cast = "str"

[[property]]
name = "voltage"
get = "VOLT?"
set = "VOLT %g"
check_set_errors = true

[[property]]
name = "range"
set = "RANG %s"
validator = ["strict_discrete_set", "strict_range"]
values = [["AUTO"], [0.1, 100]]

[[property]]
name = "status"
get = "STAT?"
separator = ";"
maxsplit = 1
cast = "str"

[[channel_group]]
class = "Output"
ids = [1, 2]

[[channel_group.property]]
name = "enabled"
get = "OUTP{ch}?"
set = "OUTP{ch} %d"
validator = "strict_discrete_set"
map = [[true, 1], [false, 0]]

[[channel_group]]
class = "Trigger"
name = "trig"
id = "EXT"
placeholder = "src"

[[channel_group.property]]
name = "level"
set = "TRIG:{src}:LEV %g"
"#;

fn generator() -> std::sync::Arc<Driver> {
    DriverConfig::from_toml(GENERATOR).unwrap().into_driver().unwrap()
}

#[test]
fn declared_driver_has_every_property() {
    let driver = generator();
    assert!(driver.is_scpi());
    let names: Vec<&str> = driver.properties().map(Property::name).collect();
    assert_eq!(names, ["frequency_khz", "range", "shape", "status", "voltage"]);

    let status = driver.properties().find(|p| p.name() == "status").unwrap();
    assert_eq!(status.kind(), PropertyKind::Measurement);
    let range = driver.properties().find(|p| p.name() == "range").unwrap();
    assert_eq!(range.kind(), PropertyKind::Setting);
    let frequency = driver.properties().find(|p| p.name() == "frequency_khz").unwrap();
    assert!(frequency.is_dynamic());
    assert_eq!(frequency.doc(), "Output frequency in kHz");
}

#[test]
fn expressions_scale_both_directions() {
    expected_protocol(
        &generator(),
        [Exchange::write("FREQ 10000"), Exchange::ask("FREQ?", "10000")],
        |inst| {
            inst.set("frequency_khz", 10).unwrap();
            assert_eq!(inst.get_as::<f64>("frequency_khz").unwrap(), 10.0);
            assert!(inst.set("frequency_khz", 60000).is_err());
        },
    );
}

#[test]
fn declared_maps_and_joined_validators() {
    expected_protocol(
        &generator(),
        [
            Exchange::write("FUNC SQU"),
            Exchange::ask("FUNC?", "SIN"),
            Exchange::write("RANG AUTO"),
            Exchange::write("RANG 20"),
            Exchange::ask("STAT?", "RUN;armed; waiting"),
        ],
        |inst| {
            inst.set("shape", "square").unwrap();
            assert_eq!(inst.get("shape").unwrap(), Value::from("sine"));
            inst.set("range", "AUTO").unwrap();
            inst.set("range", 20).unwrap();
            assert_eq!(
                inst.get("status").unwrap(),
                Value::List(vec!["RUN".into(), "armed; waiting".into()])
            );
        },
    );
}

#[test]
fn declared_error_check_runs_after_set() {
    expected_protocol(
        &generator(),
        [
            Exchange::write("VOLT 2.5"),
            Exchange::ask("SYST:ERR?", "-222,\"Data out of range\""),
            Exchange::ask("SYST:ERR?", "0,\"No error\""),
        ],
        |inst| {
            let err = inst.set("voltage", 2.5).unwrap_err();
            assert!(matches!(err, PropError::Device { .. }));
        },
    );
}

#[test]
fn declared_channels() {
    expected_protocol(
        &generator(),
        [
            Exchange::write("OUTP2 1"),
            Exchange::ask("OUTP1?", "0"),
            Exchange::write("TRIG:EXT:LEV 0.5"),
        ],
        |inst| {
            inst.channel("ch_2").unwrap().set("enabled", true).unwrap();
            assert_eq!(
                inst.channel("ch_1").unwrap().get("enabled").unwrap(),
                Value::Bool(false)
            );
            inst.channel("trig").unwrap().set("level", 0.5).unwrap();
        },
    );
}

#[test]
fn driver_loads_from_a_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(GENERATOR.as_bytes()).unwrap();
    let driver = DriverConfig::load(file.path()).unwrap().into_driver().unwrap();
    assert_eq!(driver.name(), "Generator");
    assert_eq!(driver.channel_groups().len(), 2);
}

#[test]
fn malformed_declarations_are_rejected() {
    // unknown key
    assert!(matches!(
        DriverConfig::from_toml("name = \"X\"\ncolour = \"red\""),
        Err(PropError::Toml(_))
    ));

    // range validator without [min, max]
    let config = DriverConfig::from_toml(
        r#"
        name = "X"
        [[property]]
        name = "v"
        set = "V %g"
        validator = "strict_range"
        values = [1]
        "#,
    )
    .unwrap();
    assert!(matches!(config.into_driver(), Err(PropError::Declaration(_))));

    // channel group with neither ids nor a name
    let config = DriverConfig::from_toml(
        r#"
        name = "X"
        [[channel_group]]
        class = "Output"
        "#,
    )
    .unwrap();
    assert!(matches!(config.into_driver(), Err(PropError::Declaration(_))));

    // map that is not one-to-one
    assert!(DriverConfig::from_toml(
        r#"
        name = "X"
        [[property]]
        name = "mode"
        set = "MODE %s"
        map = [["a", "A"], ["b", "A"]]
        "#,
    )
    .is_err());
}

#[test]
fn missing_driver_file_is_an_io_error() {
    let err = DriverConfig::load("/nonexistent/driver.toml").unwrap_err();
    assert!(matches!(err, PropError::Io(_)));
}

#[test]
#[serial]
fn settings_merge_file_and_environment() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[log]
level = "debug"
format = "json"

[serial]
port = "/dev/ttyACM0"
baud_rate = 19200
"#
    )
    .unwrap();

    std::env::set_var("DAQ_PROPS_SERIAL__BAUD_RATE", "115200");
    let settings = Settings::load_from(file.path());
    std::env::remove_var("DAQ_PROPS_SERIAL__BAUD_RATE");
    let settings = settings.unwrap();

    assert_eq!(settings.log.level, "debug");
    assert_eq!(settings.serial.port, "/dev/ttyACM0");
    assert_eq!(settings.serial.baud_rate, 115200);
    assert_eq!(settings.serial.timeout_ms, 1000);
    assert!(settings.validate().is_ok());
}

#[test]
#[serial]
fn settings_default_without_a_file() {
    let settings = Settings::load_from("/nonexistent/daq-props.toml").unwrap();
    assert_eq!(settings.serial.baud_rate, 9600);
    assert_eq!(settings.log.level, "info");
}

#[test]
#[serial]
fn invalid_settings_fail_validation() {
    std::env::set_var("DAQ_PROPS_LOG__LEVEL", "chatty");
    let settings = Settings::load_from("/nonexistent/daq-props.toml");
    std::env::remove_var("DAQ_PROPS_LOG__LEVEL");
    assert!(settings.unwrap().validate().is_err());
}

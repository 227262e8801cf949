//! Configuration.
//!
//! Two kinds of files are read here:
//!
//! - **Driver declarations** ([`DriverConfig`]): a TOML description of an
//!   instrument's properties and channels, turned into a [`Driver`] without
//!   writing Rust. Process hooks are `evalexpr` expressions over `value`.
//! - **Application settings** ([`Settings`]): logging and serial port options,
//!   loaded with `figment` from a TOML file and `DAQ_PROPS_` environment
//!   variables (`DAQ_PROPS_SERIAL__BAUD_RATE=115200`).
//!
//! # Example driver
//!
//! ```toml
//! name = "FunctionGenerator"
//! scpi = true
//!
//! [error_check]
//! kind = "scpi_queue"
//!
//! [[property]]
//! name = "frequency"
//! get = "FREQ?"
//! set = "FREQ %g"
//! validator = "strict_range"
//! values = [1e-3, 52.5e6]
//! dynamic = true
//!
//! [[property]]
//! name = "shape"
//! get = "FUNC?"
//! set = "FUNC %s"
//! validator = "strict_discrete_set"
//! map = [["sine", "SIN"], ["square", "SQU"]]
//!
//! [[channel_group]]
//! class = "Output"
//! ids = [1, 2]
//!
//! [[channel_group.property]]
//! name = "enabled"
//! get = "OUTP{ch}?"
//! set = "OUTP{ch} %d"
//! validator = "strict_discrete_set"
//! map = [[true, 1], [false, 0]]
//! ```

use evalexpr::{ContextWithMutableVariables, HashMapContext, Node};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::channel::{ChannelClass, ChannelGroup, ChannelId};
use crate::codec::{Cast, ReplyFormat};
use crate::error::{PropError, Result};
use crate::instrument::Driver;
use crate::logging::{parse_log_level, OutputFormat};
use crate::property::{ProcessFn, Property, PropertyKind};
use crate::scpi::ErrorCheck;
use crate::validators::{Domain, Validator};
use crate::value::Value;
use crate::value_map::ValueMap;

// =============================================================================
// Driver declarations
// =============================================================================

/// A driver described in TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    pub name: String,
    #[serde(default)]
    pub scpi: bool,
    #[serde(default)]
    pub error_check: ErrorCheck,
    #[serde(default)]
    pub property: Vec<PropertyConfig>,
    #[serde(default)]
    pub channel_group: Vec<ChannelGroupConfig>,
}

/// A single validator or, as a list, a joined validator.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ValidatorConfig {
    One(Validator),
    Joined(Vec<Validator>),
}

/// One `[[property]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropertyConfig {
    pub name: String,
    /// Inferred from which commands are present when omitted
    pub kind: Option<PropertyKind>,
    pub get: Option<String>,
    pub set: Option<String>,
    #[serde(default)]
    pub doc: String,
    pub validator: Option<ValidatorConfig>,
    /// `[min, max]` for range validators, the members for set validators,
    /// one list per part for joined validators
    #[serde(default)]
    pub values: Vec<Value>,
    /// `[[user, wire], ...]`; implies `map_values` unless set explicitly
    pub map: Option<ValueMap>,
    pub map_values: Option<bool>,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub check_set_errors: bool,
    #[serde(default)]
    pub check_get_errors: bool,
    pub separator: Option<String>,
    pub maxsplit: Option<usize>,
    pub cast: Option<Cast>,
    /// Expression over `value`, e.g. `value * 1000`
    pub get_process: Option<String>,
    pub set_process: Option<String>,
}

/// One `[[channel_group]]` table: either `ids` (+ `prefix`) or `name` + `id`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelGroupConfig {
    pub class: String,
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    #[serde(default)]
    pub ids: Vec<ChannelId>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub name: Option<String>,
    pub id: Option<ChannelId>,
    #[serde(default)]
    pub property: Vec<PropertyConfig>,
    #[serde(default)]
    pub channel_group: Vec<ChannelGroupConfig>,
}

fn default_placeholder() -> String {
    "ch".to_string()
}

fn default_prefix() -> String {
    "ch_".to_string()
}

impl DriverConfig {
    /// Parse a declaration from TOML text. Unknown keys are rejected.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a declaration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "loading driver declaration");
        Self::from_toml(&text)
    }

    /// Build the driver, checking every declaration.
    pub fn into_driver(self) -> Result<Arc<Driver>> {
        let mut builder = Driver::builder(&self.name)
            .scpi(self.scpi)
            .error_check(self.error_check);
        for property in self.property {
            builder = builder.property(property.into_property()?);
        }
        for group in self.channel_group {
            builder = builder.channels(group.into_group()?);
        }
        builder.build()
    }
}

impl PropertyConfig {
    /// Build the property, inferring its kind from the commands present.
    pub fn into_property(self) -> Result<Property> {
        let declaration = |msg: &str| PropError::Declaration(format!("property '{}': {msg}", self.name));

        let kind = match (self.kind, &self.get, &self.set) {
            (Some(kind), _, _) => kind,
            (None, Some(_), Some(_)) => PropertyKind::Control,
            (None, Some(_), None) => PropertyKind::Measurement,
            (None, None, Some(_)) => PropertyKind::Setting,
            (None, None, None) => return Err(declaration("needs a get or set command")),
        };
        let builder = match (kind, self.get.clone(), self.set.clone()) {
            (PropertyKind::Control, Some(get), Some(set)) => Property::control(&self.name, get, set, &self.doc),
            (PropertyKind::Measurement, Some(get), None) => Property::measurement(&self.name, get, &self.doc),
            (PropertyKind::Setting, None, Some(set)) => Property::setting(&self.name, set, &self.doc),
            (kind, _, _) => return Err(declaration(&format!("commands do not match kind '{kind}'"))),
        };

        let validator = match self.validator.clone() {
            None => Validator::None,
            Some(ValidatorConfig::One(v)) => v,
            Some(ValidatorConfig::Joined(vs)) => Validator::Joined(vs),
        };
        let values = match &self.map {
            Some(_) if !self.values.is_empty() => {
                return Err(declaration("give either values or map, not both"))
            }
            Some(map) => Domain::Map(map.clone()),
            None => domain_for(&validator, &self.values)?,
        };
        let map_values = self.map_values.unwrap_or(self.map.is_some());

        let mut reply = ReplyFormat::default();
        if let Some(separator) = &self.separator {
            reply.separator = separator.clone();
        }
        reply.maxsplit = self.maxsplit;
        if let Some(cast) = self.cast {
            reply.cast = cast;
        }

        builder
            .validator(validator)
            .values(values)
            .map_values(map_values)
            .dynamic(self.dynamic)
            .check_set_errors(self.check_set_errors)
            .check_get_errors(self.check_get_errors)
            .reply_format(reply)
            .process_hooks(
                self.get_process.as_deref().map(expression).transpose()?,
                self.set_process.as_deref().map(expression).transpose()?,
            )
            .build()
    }
}

impl ChannelGroupConfig {
    /// Build the channel class and its members.
    pub fn into_group(self) -> Result<ChannelGroup> {
        let mut class = ChannelClass::new(&self.class).with_placeholder(&self.placeholder);
        for property in self.property {
            class = class.property(property.into_property()?)?;
        }
        for nested in self.channel_group {
            class = class.channels(nested.into_group()?);
        }
        match (self.name, self.id) {
            (Some(name), Some(id)) if self.ids.is_empty() => Ok(ChannelGroup::single(name, class, id)),
            (None, None) if !self.ids.is_empty() => Ok(ChannelGroup::multi(class, self.ids, self.prefix)),
            _ => Err(PropError::Declaration(format!(
                "channel group '{}' needs either ids or a name and an id",
                self.class
            ))),
        }
    }
}

/// Interpret a flat `values` list according to the validator's shape.
fn domain_for(validator: &Validator, values: &[Value]) -> Result<Domain> {
    match validator {
        Validator::StrictRange
        | Validator::StrictDiscreteRange { .. }
        | Validator::TruncatedRange
        | Validator::ModularRange
        | Validator::ModularRangeBidirectional => match values {
            [min, max] => Ok(Domain::range(min.to_f64()?, max.to_f64()?)),
            other => Err(PropError::Declaration(format!(
                "range validator needs values = [min, max], got {other:?}"
            ))),
        },
        Validator::Joined(parts) => {
            if parts.len() != values.len() {
                return Err(PropError::Declaration(format!(
                    "joined validator of {} parts needs as many value lists, got {}",
                    parts.len(),
                    values.len()
                )));
            }
            parts
                .iter()
                .zip(values)
                .map(|(part, list)| match list {
                    Value::List(items) => domain_for(part, items),
                    single => domain_for(part, std::slice::from_ref(single)),
                })
                .collect::<Result<Vec<_>>>()
                .map(Domain::Joined)
        }
        _ if values.is_empty() => Ok(Domain::Any),
        _ => Ok(Domain::Set(values.to_vec())),
    }
}

/// Compile a process expression over the variable `value`.
///
/// The expression must evaluate for at least one of a zero float, a zero
/// integer, `false` or an empty string; anything else is a
/// [`PropError::Declaration`].
pub fn expression(source: &str) -> Result<ProcessFn> {
    let node = evalexpr::build_operator_tree(source)
        .map_err(|e| PropError::Declaration(format!("expression '{source}': {e}")))?;
    let samples = [
        Value::Float(0.0),
        Value::Int(0),
        Value::Bool(false),
        Value::Str(String::new()),
    ];
    if !samples.iter().any(|sample| evaluate(&node, sample).is_ok()) {
        let reason = match evaluate(&node, &samples[0]) {
            Err(e) => e.to_string(),
            Ok(_) => "no value".to_string(),
        };
        return Err(PropError::Declaration(format!("expression '{source}': {reason}")));
    }

    let node: Arc<Node> = Arc::new(node);
    Ok(Arc::new(move |value: Value| evaluate(&node, &value)))
}

fn evaluate(node: &Node, value: &Value) -> Result<Value> {
    let mut context = HashMapContext::new();
    context.set_value("value".to_string(), to_evalexpr(value))?;
    from_evalexpr(node.eval_with_context(&context)?)
}

fn to_evalexpr(value: &Value) -> evalexpr::Value {
    match value {
        Value::Bool(b) => evalexpr::Value::Boolean(*b),
        Value::Int(i) => evalexpr::Value::Int(*i),
        Value::Float(f) => evalexpr::Value::Float(*f),
        Value::Str(s) => evalexpr::Value::String(s.clone()),
        Value::List(items) => evalexpr::Value::Tuple(items.iter().map(to_evalexpr).collect()),
    }
}

fn from_evalexpr(value: evalexpr::Value) -> Result<Value> {
    Ok(match value {
        evalexpr::Value::Boolean(b) => Value::Bool(b),
        evalexpr::Value::Int(i) => Value::Int(i),
        evalexpr::Value::Float(f) => Value::Float(f),
        evalexpr::Value::String(s) => Value::Str(s),
        evalexpr::Value::Tuple(items) => {
            Value::List(items.into_iter().map(from_evalexpr).collect::<Result<_>>()?)
        }
        evalexpr::Value::Empty => {
            return Err(PropError::Expression("expression produced no value".into()))
        }
    })
}

// =============================================================================
// Application settings
// =============================================================================

/// Settings for the `daq-props` binary and anything embedding it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub serial: SerialSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: OutputFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Reply timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_termination")]
    pub write_termination: String,
    #[serde(default = "default_termination")]
    pub read_termination: String,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            write_termination: default_termination(),
            read_termination: default_termination(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_termination() -> String {
    "\n".to_string()
}

impl Settings {
    /// Load `daq-props.toml` from the working directory plus environment.
    pub fn load() -> Result<Self> {
        Self::load_from("daq-props.toml")
    }

    /// Load from `path` (missing file is fine) merged with `DAQ_PROPS_`
    /// variables; `__` separates nested keys.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_PROPS_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Check what deserialization cannot: level name, baud rate, termination and timeout.
    pub fn validate(&self) -> std::result::Result<(), String> {
        parse_log_level(&self.log.level)?;

        if self.serial.baud_rate == 0 {
            return Err("Invalid baud_rate 0".to_string());
        }
        if self.serial.read_termination.is_empty() {
            return Err("read_termination must not be empty".to_string());
        }
        if self.serial.timeout_ms == 0 {
            return Err("timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.log.level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_empty_read_termination() {
        let mut settings = Settings::default();
        settings.serial.read_termination.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_range_values() {
        let domain = domain_for(&Validator::StrictRange, &[0.into(), 10.into()]).unwrap();
        assert_eq!(domain, Domain::range(0.0, 10.0));
        assert!(domain_for(&Validator::TruncatedRange, &[1.into()]).is_err());
    }

    #[test]
    fn test_joined_values() {
        let validator = Validator::Joined(vec![Validator::StrictDiscreteSet, Validator::StrictRange]);
        let values = [Value::from(vec!["AUTO"]), Value::from(vec![0.1, 100.0])];
        let domain = domain_for(&validator, &values).unwrap();
        assert_eq!(
            domain,
            Domain::joined([Domain::set(["AUTO"]), Domain::range(0.1, 100.0)])
        );
    }

    #[test]
    fn test_expression_hooks() {
        let scale = expression("value * 1000").unwrap();
        assert_eq!(scale(Value::Float(1.5)).unwrap(), Value::Float(1500.0));
        let int = expression("value + 1").unwrap();
        assert_eq!(int(Value::Int(1)).unwrap(), Value::Int(2));
        assert!(matches!(expression("value +"), Err(PropError::Declaration(_))));
        assert!(matches!(expression("voltage * 2"), Err(PropError::Declaration(_))));
        // evaluates for booleans only
        let invert = expression("!value").unwrap();
        assert_eq!(invert(Value::Bool(true)).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_malformed_expression_fails_the_driver() {
        let config = DriverConfig::from_toml(
            r#"
            name = "X"
            [[property]]
            name = "v"
            set = "V %g"
            set_process = "value +"
            "#,
        )
        .unwrap();
        assert!(matches!(config.into_driver(), Err(PropError::Declaration(_))));
    }

    #[test]
    fn test_property_kind_is_inferred() {
        let config: PropertyConfig = toml::from_str(
            r#"
            name = "voltage"
            get = "MEAS:VOLT?"
            "#,
        )
        .unwrap();
        let property = config.into_property().unwrap();
        assert_eq!(property.kind(), PropertyKind::Measurement);
    }

    #[test]
    fn test_values_and_map_conflict() {
        let config: PropertyConfig = toml::from_str(
            r#"
            name = "mode"
            get = "MODE?"
            set = "MODE %s"
            values = ["A"]
            map = [["a", "A"]]
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.into_property(),
            Err(PropError::Declaration(_))
        ));
    }

    #[test]
    fn test_unknown_validator_name() {
        let result: std::result::Result<PropertyConfig, _> = toml::from_str(
            r#"
            name = "mode"
            set = "MODE %s"
            validator = "fuzzy_match"
            "#,
        );
        assert!(result.is_err());
    }
}

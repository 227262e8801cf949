//! Declarative instrument properties.
//!
//! A [`Property`] captures everything needed to turn a user value into a
//! device command and a device reply back into a user value: the command
//! templates, a validator with its domain, an optional value map and the
//! process hooks. Properties are declared once per driver and shared by every
//! instrument built from it; per-instance state (dynamic overrides, template
//! tokens, the adapter) lives on the [`Instrument`].
//!
//! The pipelines are fixed:
//!
//! ```text
//! set:  raw  = format(set_process(forward_map(validate(x))))
//! get:  user = reverse_map(get_process(parse(raw)))
//! ```
//!
//! # Example
//!
//! ```
//! use daq_props::property::Property;
//! use daq_props::validators::{Domain, Validator};
//!
//! let frequency = Property::control("frequency", "FREQ?", "FREQ %g", "Output frequency in Hz")
//!     .validator(Validator::StrictRange)
//!     .values(Domain::range(1e-3, 52.5e6))
//!     .build()
//!     .unwrap();
//! assert!(frequency.is_readable() && frequency.is_writable());
//! ```

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::codec::{self, Cast, ReplyFormat};
use crate::error::{PropError, Result};
use crate::instrument::Instrument;
use crate::validators::{Domain, Validator};
use crate::value::Value;
use crate::value_map::ValueMap;

/// Hook applied to a value on the get or set path.
pub type ProcessFn = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Hook applied to the raw reply before it is parsed.
pub type PreprocessFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Access flavour of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    /// Readable and writable
    Control,
    /// Read only
    Measurement,
    /// Write only, no readback
    Setting,
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropertyKind::Control => "control",
            PropertyKind::Measurement => "measurement",
            PropertyKind::Setting => "setting",
        };
        f.write_str(s)
    }
}

/// A declared property. Build one with [`Property::control`],
/// [`Property::measurement`] or [`Property::setting`].
#[derive(Clone)]
pub struct Property {
    name: String,
    kind: PropertyKind,
    doc: String,
    get_command: Option<String>,
    set_command: Option<String>,
    validator: Validator,
    values: Domain,
    map_values: bool,
    get_process: Option<ProcessFn>,
    set_process: Option<ProcessFn>,
    preprocess_reply: Option<PreprocessFn>,
    reply: ReplyFormat,
    check_set_errors: bool,
    check_get_errors: bool,
    dynamic: bool,
}

impl Property {
    /// Readable and writable property.
    pub fn control(
        name: impl Into<String>,
        get_command: impl Into<String>,
        set_command: impl Into<String>,
        doc: impl Into<String>,
    ) -> PropertyBuilder {
        PropertyBuilder::new(
            name.into(),
            PropertyKind::Control,
            Some(get_command.into()),
            Some(set_command.into()),
            doc.into(),
        )
    }

    /// Read-only property.
    pub fn measurement(
        name: impl Into<String>,
        get_command: impl Into<String>,
        doc: impl Into<String>,
    ) -> PropertyBuilder {
        PropertyBuilder::new(
            name.into(),
            PropertyKind::Measurement,
            Some(get_command.into()),
            None,
            doc.into(),
        )
    }

    /// Write-only property.
    pub fn setting(
        name: impl Into<String>,
        set_command: impl Into<String>,
        doc: impl Into<String>,
    ) -> PropertyBuilder {
        PropertyBuilder::new(
            name.into(),
            PropertyKind::Setting,
            None,
            Some(set_command.into()),
            doc.into(),
        )
    }

    /// Attribute name on the instrument.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PropertyKind {
        self.kind
    }

    /// Free-text description, may be empty.
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Query template, `None` for a setting.
    pub fn get_command(&self) -> Option<&str> {
        self.get_command.as_deref()
    }

    /// printf template with at least one placeholder, `None` for a measurement.
    pub fn set_command(&self) -> Option<&str> {
        self.set_command.as_deref()
    }

    /// Declared validator; instances may override it when the property is dynamic.
    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// Declared domain; instances may override it when the property is dynamic.
    pub fn values(&self) -> &Domain {
        &self.values
    }

    /// Whether values travel through the domain's map.
    pub fn maps_values(&self) -> bool {
        self.map_values
    }

    /// Whether instances may override validator and domain.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Has a get command.
    pub fn is_readable(&self) -> bool {
        self.get_command.is_some()
    }

    /// Has a set command.
    pub fn is_writable(&self) -> bool {
        self.set_command.is_some()
    }

    /// Copy of this property with `tokens` substituted into both templates.
    /// Tokens not in the table are left for per-access rendering.
    pub(crate) fn rendered(&self, tokens: &BTreeMap<String, String>) -> Property {
        Property {
            get_command: self
                .get_command
                .as_deref()
                .map(|t| codec::render_partial(t, tokens)),
            set_command: self
                .set_command
                .as_deref()
                .map(|t| codec::render_partial(t, tokens)),
            ..self.clone()
        }
    }

    /// Check that `domain` can be used with `validator` on this property.
    pub(crate) fn check_override(&self, validator: &Validator, domain: &Domain) -> Result<()> {
        validator.check_domain(domain)?;
        if self.map_values {
            value_map_for(&self.name, domain)?;
        }
        Ok(())
    }

    /// Query the device and return the user-facing value.
    pub fn get(&self, instrument: &Instrument) -> Result<Value> {
        let template = self
            .get_command
            .as_deref()
            .ok_or_else(|| PropError::WriteOnly(self.name.clone()))?;
        let command = codec::render(template, instrument.tokens())?;

        let raw = {
            let mut adapter = instrument.adapter().lock();
            adapter.write(&command)?;
            adapter.read()?
        };
        debug!(property = %self.name, command = %command, reply = %raw, "get");

        let parsed = self.parse(&raw);
        let processed = match &self.get_process {
            Some(process) => process(parsed)?,
            None => parsed,
        };
        let value = if self.map_values {
            let (_, domain) = instrument.effective(self);
            value_map_for(&self.name, domain)?.reverse(processed)
        } else {
            processed
        };

        if self.check_get_errors {
            instrument.check_errors()?;
        }
        Ok(value)
    }

    /// Validate, map and format `value`, then write it to the device.
    pub fn set(&self, instrument: &Instrument, value: Value) -> Result<()> {
        let template = self
            .set_command
            .as_deref()
            .ok_or_else(|| PropError::ReadOnly(self.name.clone()))?;

        let (validator, domain) = instrument.effective(self);
        let validated = validator.validate(&value, domain)?;
        let mapped = if self.map_values {
            value_map_for(&self.name, domain)?.forward(validated)
        } else {
            validated
        };
        let processed = match &self.set_process {
            Some(process) => process(mapped)?,
            None => mapped,
        };

        let template = codec::render(template, instrument.tokens())?;
        let args = match processed {
            Value::List(items)
                if items.len() != 1 && codec::placeholder_count(&template) == items.len() =>
            {
                items
            }
            other => vec![other],
        };
        let command = codec::printf(&template, &args)?;

        instrument.adapter().lock().write(&command)?;
        debug!(property = %self.name, command = %command, "set");

        if self.check_set_errors {
            instrument.check_errors()?;
        }
        Ok(())
    }

    fn parse(&self, raw: &str) -> Value {
        let reply = match &self.preprocess_reply {
            Some(preprocess) => Cow::Owned(preprocess(raw)),
            None => Cow::Borrowed(raw),
        };
        let mut items = codec::parse_reply(&reply, &self.reply);
        if items.len() == 1 {
            items.remove(0)
        } else {
            Value::List(items)
        }
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("get_command", &self.get_command)
            .field("set_command", &self.set_command)
            .field("validator", &self.validator)
            .field("values", &self.values)
            .field("map_values", &self.map_values)
            .field("dynamic", &self.dynamic)
            .finish_non_exhaustive()
    }
}

/// Value map implied by a domain when `map_values` is on.
fn value_map_for<'a>(name: &str, domain: &'a Domain) -> Result<Cow<'a, ValueMap>> {
    match domain {
        Domain::Map(map) => Ok(Cow::Borrowed(map)),
        Domain::Set(values) => ValueMap::indexed(values.iter().cloned()).map(Cow::Owned),
        other => Err(PropError::Declaration(format!(
            "property '{name}' maps values but its domain {other:?} is not a set or map"
        ))),
    }
}

/// Builder returned by the [`Property`] constructors.
pub struct PropertyBuilder {
    property: Property,
}

impl PropertyBuilder {
    fn new(
        name: String,
        kind: PropertyKind,
        get_command: Option<String>,
        set_command: Option<String>,
        doc: String,
    ) -> Self {
        Self {
            property: Property {
                name,
                kind,
                doc,
                get_command,
                set_command,
                validator: Validator::None,
                values: Domain::Any,
                map_values: false,
                get_process: None,
                set_process: None,
                preprocess_reply: None,
                reply: ReplyFormat::default(),
                check_set_errors: false,
                check_get_errors: false,
                dynamic: false,
            },
        }
    }

    /// Validator applied on set, [`Validator::None`] by default.
    pub fn validator(mut self, validator: Validator) -> Self {
        self.property.validator = validator;
        self
    }

    /// Domain the validator checks against, [`Domain::Any`] by default.
    pub fn values(mut self, values: Domain) -> Self {
        self.property.values = values;
        self
    }

    /// Translate through the domain's map (or list positions for a set).
    pub fn map_values(mut self, map_values: bool) -> Self {
        self.property.map_values = map_values;
        self
    }

    /// Hook applied to the parsed reply, before the reverse map.
    pub fn get_process(
        mut self,
        process: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.property.get_process = Some(Arc::new(process));
        self
    }

    /// Hook applied after validation and mapping, before formatting.
    pub fn set_process(
        mut self,
        process: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.property.set_process = Some(Arc::new(process));
        self
    }

    /// Rewrite the raw reply before it is split.
    pub fn preprocess_reply(mut self, preprocess: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.property.preprocess_reply = Some(Arc::new(preprocess));
        self
    }

    /// Reply separator, `,` by default.
    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.property.reply.separator = separator.into();
        self
    }

    /// Split the reply at most `maxsplit` times.
    pub fn maxsplit(mut self, maxsplit: usize) -> Self {
        self.property.reply.maxsplit = Some(maxsplit);
        self
    }

    /// Conversion of each reply element.
    pub fn cast(mut self, cast: Cast) -> Self {
        self.property.reply.cast = cast;
        self
    }

    /// Run the driver's error check after every set.
    pub fn check_set_errors(mut self, check: bool) -> Self {
        self.property.check_set_errors = check;
        self
    }

    /// Run the driver's error check after every get.
    pub fn check_get_errors(mut self, check: bool) -> Self {
        self.property.check_get_errors = check;
        self
    }

    /// Allow instances to override the validator and domain.
    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.property.dynamic = dynamic;
        self
    }

    pub(crate) fn process_hooks(mut self, get: Option<ProcessFn>, set: Option<ProcessFn>) -> Self {
        self.property.get_process = get;
        self.property.set_process = set;
        self
    }

    pub(crate) fn reply_format(mut self, reply: ReplyFormat) -> Self {
        self.property.reply = reply;
        self
    }

    /// Finish the declaration, rejecting inconsistent combinations.
    pub fn build(self) -> Result<Property> {
        let p = self.property;
        let declaration = |msg: String| PropError::Declaration(format!("property '{}': {msg}", p.name));

        if p.name.is_empty() {
            return Err(PropError::Declaration("property name is empty".into()));
        }
        p.validator.check_domain(&p.values)?;
        if p.map_values {
            value_map_for(&p.name, &p.values)?;
        }
        if let Some(set) = &p.set_command {
            if codec::placeholder_count(set) == 0 {
                return Err(declaration(format!(
                    "set command '{set}' has no value placeholder"
                )));
            }
        }
        if p.reply.maxsplit == Some(0) {
            return Err(declaration("maxsplit must be at least 1".into()));
        }
        Ok(p)
    }
}

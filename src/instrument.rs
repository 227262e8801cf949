//! Drivers and instrument instances.
//!
//! A [`Driver`] is the class-level declaration: a property table, channel
//! groups, the error-check policy. It is built once and shared. An
//! [`Instrument`] binds a driver to an adapter and carries the per-instance
//! state: template tokens, dynamic overrides and the channel children.
//!
//! ```
//! use daq_props::prelude::*;
//! use daq_props::testing::ProtocolAdapter;
//!
//! let driver = Driver::builder("Generator")
//!     .property(Property::measurement("frequency", "FREQ?", "").build()?)
//!     .build()?;
//! let adapter = ProtocolAdapter::new([("FREQ?", "1000")]);
//! let generator = Instrument::new(&driver, adapter);
//! assert_eq!(generator.get("frequency")?, Value::Float(1000.0));
//! # Ok::<(), PropError>(())
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::adapters::{share, Adapter, SharedAdapter};
use crate::channel::{check_unique_names, ChannelGroup, ChannelId};
use crate::codec::{self, BinaryFormat, Block, ReplyFormat};
use crate::error::{PropError, Result};
use crate::property::Property;
use crate::scpi::ErrorCheck;
use crate::validators::{Domain, Validator};
use crate::value::Value;

type PropertyTable = BTreeMap<String, Property>;

// =============================================================================
// Driver
// =============================================================================

/// Class-level instrument declaration.
#[derive(Debug)]
pub struct Driver {
    name: String,
    scpi: bool,
    properties: Arc<PropertyTable>,
    channel_groups: Vec<ChannelGroup>,
    error_check: Arc<ErrorCheck>,
}

impl Driver {
    /// Start declaring a driver called `name`.
    pub fn builder(name: impl Into<String>) -> DriverBuilder {
        DriverBuilder {
            name: name.into(),
            scpi: false,
            properties: Vec::new(),
            channel_groups: Vec::new(),
            error_check: ErrorCheck::None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the [`Scpi`](crate::scpi::Scpi) commands apply.
    pub fn is_scpi(&self) -> bool {
        self.scpi
    }

    /// Top-level properties, sorted by name.
    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    /// Channel groups in declaration order.
    pub fn channel_groups(&self) -> &[ChannelGroup] {
        &self.channel_groups
    }

    /// Policy run by [`Instrument::check_errors`] and by properties that opt in.
    pub fn error_check(&self) -> &ErrorCheck {
        &self.error_check
    }
}

/// Builder returned by [`Driver::builder`].
pub struct DriverBuilder {
    name: String,
    scpi: bool,
    properties: Vec<Property>,
    channel_groups: Vec<ChannelGroup>,
    error_check: ErrorCheck,
}

impl DriverBuilder {
    /// Add a top-level property.
    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Add a channel group.
    pub fn channels(mut self, group: ChannelGroup) -> Self {
        self.channel_groups.push(group);
        self
    }

    /// Error-check policy, [`ErrorCheck::None`] by default.
    pub fn error_check(mut self, error_check: ErrorCheck) -> Self {
        self.error_check = error_check;
        self
    }

    /// Mark the driver as speaking SCPI, enabling the [`Scpi`](crate::scpi::Scpi) commands.
    pub fn scpi(mut self, scpi: bool) -> Self {
        self.scpi = scpi;
        self
    }

    /// Finish the declaration.
    ///
    /// # Errors
    ///
    /// [`PropError::Declaration`] when a property is declared twice or a name
    /// is used by two channels, or by a channel and a property.
    pub fn build(self) -> Result<Arc<Driver>> {
        let mut properties = PropertyTable::new();
        for property in self.properties {
            let name = property.name().to_string();
            if properties.insert(name.clone(), property).is_some() {
                return Err(PropError::Declaration(format!(
                    "driver '{}' declares property '{name}' twice",
                    self.name
                )));
            }
        }
        check_unique_names(&self.name, &self.channel_groups)?;
        if let Some(name) = self
            .channel_groups
            .iter()
            .flat_map(ChannelGroup::members)
            .map(|(name, _)| name)
            .find(|name| properties.contains_key(name))
        {
            return Err(PropError::Declaration(format!(
                "driver '{}' uses '{name}' for both a property and a channel",
                self.name
            )));
        }

        Ok(Arc::new(Driver {
            name: self.name,
            scpi: self.scpi,
            properties: Arc::new(properties),
            channel_groups: self.channel_groups,
            error_check: Arc::new(self.error_check),
        }))
    }
}

// =============================================================================
// Instrument
// =============================================================================

/// Per-instance replacement of a dynamic property's validator or domain.
#[derive(Debug, Clone, Default)]
struct Override {
    validator: Option<Validator>,
    values: Option<Domain>,
}

/// A driver bound to an adapter. Channels are child instruments.
pub struct Instrument {
    name: String,
    scpi: bool,
    properties: Arc<PropertyTable>,
    adapter: SharedAdapter,
    error_check: Arc<ErrorCheck>,
    tokens: BTreeMap<String, String>,
    overrides: BTreeMap<String, Override>,
    channels: BTreeMap<String, Instrument>,
    id: Option<ChannelId>,
}

impl Instrument {
    /// Bind `driver` to a fresh adapter.
    pub fn new(driver: &Driver, adapter: impl Adapter + 'static) -> Self {
        Self::with_adapter(driver, share(adapter))
    }

    /// Build on an adapter that is already shared, e.g. with another instrument
    /// on the same bus.
    pub fn with_adapter(driver: &Driver, adapter: SharedAdapter) -> Self {
        debug!(driver = %driver.name, adapter = %adapter.lock().info(), "creating instrument");
        let channels = build_channels(
            &driver.channel_groups,
            &BTreeMap::new(),
            &adapter,
            &driver.error_check,
            driver.scpi,
        );
        Self {
            name: driver.name.clone(),
            scpi: driver.scpi,
            properties: Arc::clone(&driver.properties),
            adapter,
            error_check: Arc::clone(&driver.error_check),
            tokens: BTreeMap::new(),
            overrides: BTreeMap::new(),
            channels,
            id: None,
        }
    }

    /// Driver name, or the channel name for a channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_scpi(&self) -> bool {
        self.scpi
    }

    /// Adapter shared with the parent and sibling channels.
    pub fn adapter(&self) -> &SharedAdapter {
        &self.adapter
    }

    /// Id of this channel, `None` for a top-level instrument.
    pub fn channel_id(&self) -> Option<&ChannelId> {
        self.id.as_ref()
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    /// Declared property `name` of this instrument or channel.
    pub fn property(&self, name: &str) -> Result<&Property> {
        self.properties
            .get(name)
            .ok_or_else(|| PropError::UnknownProperty(format!("{}.{name}", self.name)))
    }

    /// Properties of this instrument, with channel templates already rendered.
    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    /// Read property `name` from the device.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.property(name)?.get(self)
    }

    /// Get and convert, e.g. `inst.get_as::<f64>("voltage")`.
    pub fn get_as<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = PropError>,
    {
        T::try_from(self.get(name)?)
    }

    /// Validate `value` and write it to property `name`.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.property(name)?.set(self, value.into())
    }

    // -------------------------------------------------------------------------
    // Template tokens
    // -------------------------------------------------------------------------

    /// Value substituted for `{key}` in command templates of this instrument.
    pub fn set_token(&mut self, key: impl Into<String>, value: impl ToString) {
        self.tokens.insert(key.into(), value.to_string());
    }

    /// Tokens rendered into this instrument's templates, channel ids included.
    pub fn tokens(&self) -> &BTreeMap<String, String> {
        &self.tokens
    }

    // -------------------------------------------------------------------------
    // Dynamic overrides
    // -------------------------------------------------------------------------

    /// Validator and domain in force for `property` on this instance.
    pub(crate) fn effective<'a>(&'a self, property: &'a Property) -> (&'a Validator, &'a Domain) {
        let entry = if property.is_dynamic() {
            self.overrides.get(property.name())
        } else {
            None
        };
        (
            entry
                .and_then(|o| o.validator.as_ref())
                .unwrap_or(property.validator()),
            entry
                .and_then(|o| o.values.as_ref())
                .unwrap_or(property.values()),
        )
    }

    fn dynamic_property(&self, name: &str) -> Result<Property> {
        let property = self.property(name)?;
        if !property.is_dynamic() {
            return Err(PropError::NotDynamic(name.to_string()));
        }
        Ok(property.clone())
    }

    /// Replace the validator, the domain, or both, of a dynamic property on
    /// this instance only.
    ///
    /// The resulting pair is checked as a whole, so a range property can be
    /// turned into a discrete set in one call. `None` keeps what is in force.
    ///
    /// ```
    /// use daq_props::prelude::*;
    /// use daq_props::testing::ProtocolAdapter;
    ///
    /// let driver = Driver::builder("SourceMeter")
    ///     .property(
    ///         Property::control("current", "CURR?", "CURR %g", "")
    ///             .validator(Validator::StrictRange)
    ///             .values(Domain::range(0.0, 100.0))
    ///             .dynamic(true)
    ///             .build()?,
    ///     )
    ///     .build()?;
    /// let mut meter = Instrument::new(&driver, ProtocolAdapter::new(Vec::<(&str, &str)>::new()));
    /// meter.set_override(
    ///     "current",
    ///     Some(Validator::StrictDiscreteSet),
    ///     Some(Domain::set([1.0, 10.0])),
    /// )?;
    /// assert!(meter.set("current", 5).is_err());
    /// # Ok::<(), PropError>(())
    /// ```
    pub fn set_override(
        &mut self,
        name: &str,
        validator: Option<Validator>,
        values: Option<Domain>,
    ) -> Result<()> {
        let property = self.dynamic_property(name)?;
        {
            let (current_validator, current_values) = self.effective(&property);
            property.check_override(
                validator.as_ref().unwrap_or(current_validator),
                values.as_ref().unwrap_or(current_values),
            )?;
        }
        debug!(instrument = %self.name, property = name, ?validator, ?values, "override");
        let entry = self.overrides.entry(name.to_string()).or_default();
        if validator.is_some() {
            entry.validator = validator;
        }
        if values.is_some() {
            entry.values = values;
        }
        Ok(())
    }

    /// Replace the domain of a dynamic property on this instance only.
    pub fn set_values(&mut self, name: &str, values: Domain) -> Result<()> {
        self.set_override(name, None, Some(values))
    }

    /// Replace the validator of a dynamic property on this instance only.
    pub fn set_validator(&mut self, name: &str, validator: Validator) -> Result<()> {
        self.set_override(name, Some(validator), None)
    }

    /// Drop the overrides of `name`, returning to the declaration.
    pub fn clear_override(&mut self, name: &str) -> Result<()> {
        self.dynamic_property(name)?;
        self.overrides.remove(name);
        Ok(())
    }

    /// Domain in force for `name`, override or declaration.
    pub fn effective_values(&self, name: &str) -> Result<&Domain> {
        let property = self.property(name)?;
        Ok(self.effective(property).1)
    }

    /// Validator in force for `name`, override or declaration.
    pub fn effective_validator(&self, name: &str) -> Result<&Validator> {
        let property = self.property(name)?;
        Ok(self.effective(property).0)
    }

    // -------------------------------------------------------------------------
    // Channels
    // -------------------------------------------------------------------------

    /// Direct child channel `name`.
    pub fn channel(&self, name: &str) -> Result<&Instrument> {
        self.channels
            .get(name)
            .ok_or_else(|| PropError::UnknownChannel(format!("{}.{name}", self.name)))
    }

    /// Mutable child channel, e.g. to override one of its properties.
    pub fn channel_mut(&mut self, name: &str) -> Result<&mut Instrument> {
        let owner = self.name.clone();
        self.channels
            .get_mut(name)
            .ok_or_else(|| PropError::UnknownChannel(format!("{owner}.{name}")))
    }

    /// Channel `prefix` + `id`, e.g. `channel_at("ch_", 2)`.
    pub fn channel_at(&self, prefix: &str, id: impl Into<ChannelId>) -> Result<&Instrument> {
        self.channel(&format!("{prefix}{}", id.into()))
    }

    /// Nested channel by dotted path, `"mod_1.ch_2"`.
    pub fn channel_path(&self, path: &str) -> Result<&Instrument> {
        path.split('.')
            .try_fold(self, |inst, name| inst.channel(name))
    }

    /// Direct children, sorted by name.
    pub fn channels(&self) -> impl Iterator<Item = (&str, &Instrument)> {
        self.channels.iter().map(|(name, inst)| (name.as_str(), inst))
    }

    // -------------------------------------------------------------------------
    // Direct I/O
    // -------------------------------------------------------------------------

    /// Write a command, rendering `{token}` placeholders first.
    pub fn write(&self, command: &str) -> Result<()> {
        let command = codec::render(command, &self.tokens)?;
        debug!(instrument = %self.name, command = %command, "write");
        self.adapter.lock().write(&command)
    }

    /// Read one reply.
    pub fn read(&self) -> Result<String> {
        let reply = self.adapter.lock().read()?;
        debug!(instrument = %self.name, reply = %reply, "read");
        Ok(reply)
    }

    /// Write a query and read its reply without releasing the adapter.
    pub fn ask(&self, command: &str) -> Result<String> {
        let command = codec::render(command, &self.tokens)?;
        let reply = {
            let mut adapter = self.adapter.lock();
            adapter.write(&command)?;
            adapter.read()?
        };
        debug!(instrument = %self.name, command = %command, reply = %reply, "ask");
        Ok(reply)
    }

    /// Ask and split the reply into values.
    pub fn values(&self, command: &str, format: &ReplyFormat) -> Result<Vec<Value>> {
        let reply = self.ask(command)?;
        Ok(codec::parse_reply(&reply, format))
    }

    /// Read exactly `count` raw bytes.
    pub fn read_bytes(&self, count: usize) -> Result<Vec<u8>> {
        self.adapter.lock().read_bytes(count)
    }

    /// Write raw bytes, no termination added.
    pub fn write_bytes(&self, data: &[u8]) -> Result<()> {
        debug!(instrument = %self.name, len = data.len(), "write bytes");
        self.adapter.lock().write_bytes(data)
    }

    /// Query a binary block and decode its elements.
    pub fn binary_values(&self, command: &str, block: Block, format: BinaryFormat) -> Result<Vec<Value>> {
        let command = codec::render(command, &self.tokens)?;
        let payload = {
            let mut adapter = self.adapter.lock();
            adapter.write(&command)?;
            match block {
                Block::Ieee488 => {
                    let head = adapter.read_bytes(2)?;
                    let digits = match head.as_slice() {
                        [b'#', n] if n.is_ascii_digit() && *n != b'0' => usize::from(n - b'0'),
                        [b'#', b'0'] => {
                            return Err(PropError::Unsupported("indefinite-length IEEE 488.2 blocks"))
                        }
                        other => {
                            return Err(PropError::Protocol(format!(
                                "expected an IEEE 488.2 block header, got {:?}",
                                String::from_utf8_lossy(other)
                            )))
                        }
                    };
                    let length = codec::ieee_block_length(&adapter.read_bytes(digits)?)?;
                    adapter.read_bytes(length)?
                }
                Block::Fixed { header_bytes, count } => {
                    let total = count
                        .checked_mul(format.size())
                        .and_then(|payload| payload.checked_add(header_bytes))
                        .ok_or_else(|| {
                            PropError::Protocol(format!(
                                "block of {count} elements after a {header_bytes} byte header is too large"
                            ))
                        })?;
                    let mut data = adapter.read_bytes(total)?;
                    data.drain(..header_bytes.min(data.len()));
                    data
                }
            }
        };
        debug!(instrument = %self.name, command = %command, bytes = payload.len(), "binary values");
        codec::decode_block(&payload, format)
    }

    /// Run the driver's error-check policy now.
    pub fn check_errors(&self) -> Result<()> {
        self.error_check.run(&self.adapter)
    }
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("properties", &self.properties.keys().collect::<Vec<_>>())
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Instantiate every channel of `groups`, rendering the placeholder of each
/// class into its templates. `inherited` carries the tokens of enclosing
/// channels so nested templates can refer to them.
fn build_channels(
    groups: &[ChannelGroup],
    inherited: &BTreeMap<String, String>,
    adapter: &SharedAdapter,
    error_check: &Arc<ErrorCheck>,
    scpi: bool,
) -> BTreeMap<String, Instrument> {
    let mut channels = BTreeMap::new();
    for group in groups {
        let class = group.class();
        for (name, id) in group.members() {
            let mut tokens = inherited.clone();
            tokens.insert(class.placeholder().to_string(), id.to_string());
            let properties: PropertyTable = class
                .properties()
                .iter()
                .map(|(key, property)| (key.clone(), property.rendered(&tokens)))
                .collect();
            let children = build_channels(class.groups(), &tokens, adapter, error_check, scpi);
            channels.insert(
                name.clone(),
                Instrument {
                    name,
                    scpi,
                    properties: Arc::new(properties),
                    adapter: Arc::clone(adapter),
                    error_check: Arc::clone(error_check),
                    tokens,
                    overrides: BTreeMap::new(),
                    channels: children,
                    id: Some(id),
                },
            );
        }
    }
    channels
}

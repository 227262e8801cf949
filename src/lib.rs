//! # daq-props
//!
//! Declarative property mapping for laboratory instrument drivers.
//!
//! A driver is a table of [`Property`](property::Property) declarations: a get
//! command, a set command, a validator with its domain, an optional value map
//! and process hooks. An [`Instrument`](instrument::Instrument) binds a driver
//! to an [`Adapter`](adapters::Adapter) and turns `get`/`set` calls into
//! command/reply exchanges.
//!
//! ## Crate Structure
//!
//! - **`validators`**: range, discrete set, truncating and modular checks.
//! - **`value_map`**: bijective user value ↔ wire token translation.
//! - **`codec`**: printf formatting, `{token}` templates, reply and binary block parsing.
//! - **`property`**: the property builder and its get/set pipelines.
//! - **`instrument`**: drivers, instances, dynamic overrides, direct I/O.
//! - **`channel`**: channel classes and groups (`ch_1`, `ch_2`, ...).
//! - **`scpi`**: SCPI common commands and device error queues.
//! - **`adapters`**: the transport contract and a serial adapter.
//! - **`testing`**: scripted adapter and `expected_protocol`.
//! - **`config`**: TOML driver declarations and application settings.
//! - **`logging`**: tracing subscriber setup.

pub mod adapters;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod property;
pub mod scpi;
pub mod testing;
pub mod validators;
pub mod value;
pub mod value_map;

pub use error::{PropError, Result};

/// Common imports for writing and using drivers.
pub mod prelude {
    pub use crate::adapters::{Adapter, SharedAdapter};
    pub use crate::channel::{ChannelClass, ChannelGroup, ChannelId};
    pub use crate::codec::{BinaryFormat, Block, Cast, ReplyFormat};
    pub use crate::error::{PropError, Result};
    pub use crate::instrument::{Driver, Instrument};
    pub use crate::property::{Property, PropertyKind};
    pub use crate::scpi::{ErrorCheck, Scpi};
    pub use crate::validators::{Domain, Validator};
    pub use crate::value::Value;
    pub use crate::value_map::ValueMap;
}

//! CLI entry point for daq-props
//!
//! Describe a TOML driver declaration, or read and write its properties on a
//! serial instrument.
//!
//! ```bash
//! daq-props describe drivers/generator.toml
//! daq-props --config daq-props.toml get drivers/generator.toml frequency
//! daq-props set drivers/supply.toml voltage 1.5 --channel ch_2
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use daq_props::channel::ChannelGroup;
use daq_props::config::{DriverConfig, Settings};
use daq_props::instrument::{Driver, Instrument};
use daq_props::logging::{self, TracingConfig};
use daq_props::value::Value;

#[derive(Parser)]
#[command(name = "daq-props")]
#[command(about = "Declarative instrument property access", long_about = None)]
struct Cli {
    /// Application settings file (logging, serial port)
    #[arg(long, global = true, default_value = "daq-props.toml")]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the properties and channels of a driver
    Describe {
        /// Driver declaration (TOML)
        driver: PathBuf,
    },

    /// Read a property
    Get {
        driver: PathBuf,
        property: String,
        /// Channel path, e.g. `ch_2` or `mod_1.ch_2`
        #[arg(long)]
        channel: Option<String>,
    },

    /// Write a property
    Set {
        driver: PathBuf,
        property: String,
        value: String,
        #[arg(long)]
        channel: Option<String>,
    },
}

#[derive(Serialize)]
struct PropertySummary {
    channel: Option<String>,
    name: String,
    kind: String,
    get: Option<String>,
    set: Option<String>,
    dynamic: bool,
    doc: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    settings.validate().map_err(anyhow::Error::msg)?;
    logging::init(TracingConfig::from_settings(&settings.log).map_err(anyhow::Error::msg)?)
        .map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Describe { driver } => {
            let driver = load_driver(&driver)?;
            describe(&driver, cli.json)
        }
        Commands::Get {
            driver,
            property,
            channel,
        } => {
            let driver = load_driver(&driver)?;
            let instrument = connect(&driver, &settings)?;
            let target = select(&instrument, channel.as_deref())?;
            let value = target
                .get(&property)
                .with_context(|| format!("Failed to read '{property}'"))?;
            print_value(&value, cli.json)
        }
        Commands::Set {
            driver,
            property,
            value,
            channel,
        } => {
            let driver = load_driver(&driver)?;
            let instrument = connect(&driver, &settings)?;
            let target = select(&instrument, channel.as_deref())?;
            let value = parse_value(&value);
            target
                .set(&property, value.clone())
                .with_context(|| format!("Failed to write '{property}'"))?;
            info!(property = %property, value = %value, "property written");
            Ok(())
        }
    }
}

fn load_driver(path: &Path) -> Result<Arc<Driver>> {
    DriverConfig::load(path)
        .and_then(DriverConfig::into_driver)
        .with_context(|| format!("Invalid driver declaration {}", path.display()))
}

#[cfg(feature = "instrument_serial")]
fn connect(driver: &Driver, settings: &Settings) -> Result<Instrument> {
    let adapter = daq_props::adapters::SerialAdapter::open(&settings.serial)
        .with_context(|| format!("Failed to open serial port {}", settings.serial.port))?;
    Ok(Instrument::new(driver, adapter))
}

#[cfg(not(feature = "instrument_serial"))]
fn connect(_driver: &Driver, _settings: &Settings) -> Result<Instrument> {
    anyhow::bail!("built without the instrument_serial feature")
}

fn select<'a>(instrument: &'a Instrument, channel: Option<&str>) -> Result<&'a Instrument> {
    match channel {
        Some(path) => Ok(instrument.channel_path(path)?),
        None => Ok(instrument),
    }
}

/// Interpret a command-line value: bool, integer, float, else string.
fn parse_value(text: &str) -> Value {
    if let Ok(b) = text.parse::<bool>() {
        Value::Bool(b)
    } else if let Ok(i) = text.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = text.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::Str(text.to_string())
    }
}

fn print_value(value: &Value, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(value)?);
    } else {
        println!("{value}");
    }
    Ok(())
}

/// One row per property, channel properties at every nesting depth.
fn rows(driver: &Driver) -> Vec<PropertySummary> {
    let mut rows: Vec<PropertySummary> = driver
        .properties()
        .map(|p| summary(None, p))
        .collect();
    collect_channels(driver.channel_groups(), None, &mut rows);
    rows
}

fn collect_channels(groups: &[ChannelGroup], prefix: Option<&str>, rows: &mut Vec<PropertySummary>) {
    for group in groups {
        for (name, _) in group.members() {
            let path = match prefix {
                Some(parent) => format!("{parent}.{name}"),
                None => name,
            };
            rows.extend(
                group
                    .class()
                    .properties()
                    .values()
                    .map(|p| summary(Some(path.clone()), p)),
            );
            collect_channels(group.class().groups(), Some(&path), rows);
        }
    }
}

fn describe(driver: &Driver, json: bool) -> Result<()> {
    let rows = rows(driver);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    println!("{}{}", driver.name(), if driver.is_scpi() { " (SCPI)" } else { "" });
    for row in rows {
        let name = match &row.channel {
            Some(channel) => format!("{channel}.{}", row.name),
            None => row.name.clone(),
        };
        println!(
            "  {:<24} {:<12} get={:<20} set={:<20}{}",
            name,
            row.kind,
            row.get.as_deref().unwrap_or("-"),
            row.set.as_deref().unwrap_or("-"),
            if row.dynamic { " dynamic" } else { "" }
        );
        if !row.doc.is_empty() {
            println!("      {}", row.doc);
        }
    }
    Ok(())
}

fn summary(channel: Option<String>, p: &daq_props::property::Property) -> PropertySummary {
    PropertySummary {
        channel,
        name: p.name().to_string(),
        kind: p.kind().to_string(),
        get: p.get_command().map(str::to_string),
        set: p.set_command().map(str::to_string),
        dynamic: p.is_dynamic(),
        doc: p.doc().to_string(),
    }
}

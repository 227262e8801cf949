//! Validators - domain checks applied to a value before it is written.
//!
//! A property declares a [`Validator`] (which check to run) and a [`Domain`]
//! (what the check runs against). Keeping the two apart lets a dynamic
//! property swap the domain per instance while keeping the same check, the
//! way `strict_range` with `[0, 100]` can become `strict_range` with `[0, 5]`
//! on a lower-rated hardware variant.
//!
//! Strict validators fail with [`PropError::Validation`]. Truncating and
//! modular validators never fail on a numeric input in range of their domain
//! shape; they return the corrected value instead.
//!
//! # Example
//!
//! ```
//! use daq_props::validators::{strict_range, Domain};
//!
//! let domain = Domain::range(0.0, 10.0);
//! assert!(strict_range(&5.into(), &domain).is_ok());
//! assert!(strict_range(&15.into(), &domain).is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::warn;

use crate::error::{PropError, Result};
use crate::value::Value;
use crate::value_map::ValueMap;

// =============================================================================
// Domain
// =============================================================================

/// The set of legal values a validator checks against.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    /// No domain; only meaningful with [`Validator::None`] or a custom check
    Any,

    /// Inclusive numeric range
    Range { min: f64, max: f64 },

    /// Explicit set of permitted values
    Set(Vec<Value>),

    /// Permitted values are the map keys
    Map(ValueMap),

    /// One sub-domain per validator of a [`Validator::Joined`]
    Joined(Vec<Domain>),
}

impl Domain {
    /// Inclusive `[min, max]`.
    pub fn range(min: f64, max: f64) -> Self {
        Domain::Range { min, max }
    }

    /// Discrete set, in declaration order.
    pub fn set<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Self {
        Domain::Set(values.into_iter().map(Into::into).collect())
    }

    pub fn map(map: ValueMap) -> Self {
        Domain::Map(map)
    }

    pub fn joined(domains: impl IntoIterator<Item = Domain>) -> Self {
        Domain::Joined(domains.into_iter().collect())
    }

    fn bounds(&self) -> Result<(f64, f64)> {
        match self {
            Domain::Range { min, max } => Ok((*min, *max)),
            other => Err(PropError::Declaration(format!(
                "a range validator needs a [min, max] domain, got {other:?}"
            ))),
        }
    }

    fn members(&self) -> Result<Vec<&Value>> {
        match self {
            Domain::Set(values) => Ok(values.iter().collect()),
            Domain::Map(map) => Ok(map.keys().collect()),
            other => Err(PropError::Declaration(format!(
                "a discrete-set validator needs a set or map domain, got {other:?}"
            ))),
        }
    }

    /// The value map carried by this domain, if any.
    pub fn value_map(&self) -> Option<&ValueMap> {
        match self {
            Domain::Map(map) => Some(map),
            _ => None,
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Signature of a user supplied validator.
pub type ValidatorFn = Arc<dyn Fn(&Value, &Domain) -> Result<Value> + Send + Sync>;

/// A named validation policy.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validator {
    /// Accept anything
    #[default]
    None,

    /// Fail unless `min <= value <= max`
    StrictRange,

    /// Strict range, and the value must be a multiple of `step`
    StrictDiscreteRange { step: f64 },

    /// Fail unless the value is a member of the set (or a map key)
    StrictDiscreteSet,

    /// Clamp into `[min, max]`
    TruncatedRange,

    /// Pick the nearest permitted value
    TruncatedDiscreteSet,

    /// Wrap into `[min, max)`
    ModularRange,

    /// Wrap positive values modulo `max`, negative values modulo `|min|`
    ModularRangeBidirectional,

    /// Try each validator against its own sub-domain, first success wins
    Joined(Vec<Validator>),

    /// Custom validation function (not serializable)
    #[serde(skip)]
    Custom(ValidatorFn),
}

impl Validator {
    /// Wrap a closure as a validator.
    pub fn custom(f: impl Fn(&Value, &Domain) -> Result<Value> + Send + Sync + 'static) -> Self {
        Validator::Custom(Arc::new(f))
    }

    /// Run the check, returning the (possibly corrected) value.
    pub fn validate(&self, value: &Value, domain: &Domain) -> Result<Value> {
        match self {
            Validator::None => Ok(value.clone()),
            Validator::StrictRange => strict_range(value, domain),
            Validator::StrictDiscreteRange { step } => strict_discrete_range(value, domain, *step),
            Validator::StrictDiscreteSet => strict_discrete_set(value, domain),
            Validator::TruncatedRange => truncated_range(value, domain),
            Validator::TruncatedDiscreteSet => truncated_discrete_set(value, domain),
            Validator::ModularRange => modular_range(value, domain),
            Validator::ModularRangeBidirectional => modular_range_bidirectional(value, domain),
            Validator::Joined(validators) => joined_validators(validators, value, domain),
            Validator::Custom(f) => f(value, domain),
        }
    }

    /// Check that `domain` has the shape this validator expects.
    ///
    /// Called when a property is declared or overridden so a mismatch
    /// surfaces before any value is written.
    pub fn check_domain(&self, domain: &Domain) -> Result<()> {
        match self {
            Validator::None | Validator::Custom(_) => Ok(()),
            Validator::StrictRange
            | Validator::TruncatedRange
            | Validator::ModularRange
            | Validator::ModularRangeBidirectional => {
                let (min, max) = domain.bounds()?;
                if min > max {
                    return Err(PropError::Declaration(format!(
                        "range [{min}, {max}] has min > max"
                    )));
                }
                Ok(())
            }
            Validator::StrictDiscreteRange { step } => {
                if *step <= 0.0 {
                    return Err(PropError::Declaration(format!(
                        "discrete range step must be positive, got {step}"
                    )));
                }
                domain.bounds().map(|_| ())
            }
            Validator::StrictDiscreteSet | Validator::TruncatedDiscreteSet => {
                domain.members().map(|_| ())
            }
            Validator::Joined(validators) => match domain {
                Domain::Joined(domains) if domains.len() == validators.len() => validators
                    .iter()
                    .zip(domains)
                    .try_for_each(|(v, d)| v.check_domain(d)),
                other => Err(PropError::Declaration(format!(
                    "joined validator of {} parts needs as many sub-domains, got {other:?}",
                    validators.len()
                ))),
            },
        }
    }
}

impl Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Validator::None => write!(f, "None"),
            Validator::StrictRange => write!(f, "StrictRange"),
            Validator::StrictDiscreteRange { step } => f
                .debug_struct("StrictDiscreteRange")
                .field("step", step)
                .finish(),
            Validator::StrictDiscreteSet => write!(f, "StrictDiscreteSet"),
            Validator::TruncatedRange => write!(f, "TruncatedRange"),
            Validator::TruncatedDiscreteSet => write!(f, "TruncatedDiscreteSet"),
            Validator::ModularRange => write!(f, "ModularRange"),
            Validator::ModularRangeBidirectional => write!(f, "ModularRangeBidirectional"),
            Validator::Joined(validators) => f.debug_tuple("Joined").field(validators).finish(),
            Validator::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

// =============================================================================
// Validator functions
// =============================================================================

fn numeric(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .filter(|_| value.is_numeric())
        .ok_or_else(|| PropError::Validation(format!("{value:?} is not a number")))
}

/// Keep integers as integers when the corrected value is still integral.
fn like(original: &Value, corrected: f64) -> Value {
    match original {
        Value::Int(_) if corrected.fract() == 0.0 => Value::Int(corrected as i64),
        _ => Value::Float(corrected),
    }
}

/// Fail unless `min <= value <= max`.
pub fn strict_range(value: &Value, domain: &Domain) -> Result<Value> {
    let (min, max) = domain.bounds()?;
    let v = numeric(value)?;
    if min <= v && v <= max {
        Ok(value.clone())
    } else {
        Err(PropError::Validation(format!(
            "Value of {v} is not in range [{min},{max}]"
        )))
    }
}

/// Strict range check plus: the value must be a multiple of `step`.
pub fn strict_discrete_range(value: &Value, domain: &Domain, step: f64) -> Result<Value> {
    let checked = strict_range(value, domain)?;
    let v = numeric(&checked)?;
    let steps = v / step;
    if (steps - steps.round()).abs() <= 1e-9 * steps.abs().max(1.0) {
        Ok(checked)
    } else {
        Err(PropError::Validation(format!(
            "Value of {v} is not a multiple of step {step}"
        )))
    }
}

/// Fail unless the value is exactly one of the permitted values.
pub fn strict_discrete_set(value: &Value, domain: &Domain) -> Result<Value> {
    let members = domain.members()?;
    match members.into_iter().find(|m| *m == value) {
        Some(member) => Ok(member.clone()),
        None => Err(PropError::Validation(format!(
            "Value of {value:?} is not in the discrete set {domain:?}"
        ))),
    }
}

/// Clamp the value into `[min, max]`.
pub fn truncated_range(value: &Value, domain: &Domain) -> Result<Value> {
    let (min, max) = domain.bounds()?;
    let v = numeric(value)?;
    if v < min || v > max {
        let clamped = v.clamp(min, max);
        warn!(value = v, clamped, "value truncated into [{min}, {max}]");
        Ok(like(value, clamped))
    } else {
        Ok(value.clone())
    }
}

/// Replace the value by the nearest permitted one.
///
/// Ties go to the larger candidate. Non-numeric values are accepted only on
/// an exact match.
pub fn truncated_discrete_set(value: &Value, domain: &Domain) -> Result<Value> {
    let members = domain.members()?;
    if let Some(member) = members.iter().copied().find(|m| *m == value) {
        return Ok(member.clone());
    }
    let v = numeric(value).map_err(|_| {
        PropError::Validation(format!(
            "Value of {value:?} is not in the discrete set {domain:?}"
        ))
    })?;

    let mut best: Option<(&Value, f64)> = None;
    for member in members.into_iter().filter(|m| m.is_numeric()) {
        let m = member.as_f64().unwrap_or(f64::NAN);
        let distance = (m - v).abs();
        best = match best {
            Some((current, d))
                if d < distance
                    || (d == distance && current.as_f64().unwrap_or(f64::NAN) > m) =>
            {
                Some((current, d))
            }
            _ => Some((member, distance)),
        };
    }

    match best {
        Some((member, _)) => {
            warn!(value = v, chosen = ?member, "value truncated to nearest permitted value");
            Ok(member.clone())
        }
        None => Err(PropError::Validation(format!(
            "Discrete set {domain:?} has no numeric value near {v}"
        ))),
    }
}

/// Wrap the value into `[min, max)`.
pub fn modular_range(value: &Value, domain: &Domain) -> Result<Value> {
    let (min, max) = domain.bounds()?;
    let v = numeric(value)?;
    let span = max - min;
    if span <= 0.0 {
        return Err(PropError::Declaration(format!(
            "modular range [{min}, {max}] is empty"
        )));
    }
    Ok(like(value, (v - min).rem_euclid(span) + min))
}

/// Wrap positive values modulo `max` and negative values modulo `|min|`.
pub fn modular_range_bidirectional(value: &Value, domain: &Domain) -> Result<Value> {
    let (min, max) = domain.bounds()?;
    let v = numeric(value)?;
    let wrapped = if v > 0.0 {
        v % max
    } else {
        -(v.abs() % min.abs())
    };
    Ok(like(value, wrapped))
}

/// Try each validator against its sub-domain in order; first success wins.
pub fn joined_validators(validators: &[Validator], value: &Value, domain: &Domain) -> Result<Value> {
    let domains = match domain {
        Domain::Joined(domains) if domains.len() == validators.len() => domains,
        other => {
            return Err(PropError::Declaration(format!(
                "joined validator of {} parts needs as many sub-domains, got {other:?}",
                validators.len()
            )))
        }
    };

    let mut failures = Vec::new();
    for (validator, sub_domain) in validators.iter().zip(domains) {
        match validator.validate(value, sub_domain) {
            Ok(accepted) => return Ok(accepted),
            Err(err) => failures.push(err.to_string()),
        }
    }
    Err(PropError::Validation(format!(
        "Value of {value:?} rejected by every joined validator: {}",
        failures.join("; ")
    )))
}

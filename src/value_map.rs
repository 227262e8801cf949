//! Bidirectional translation between user values and wire tokens.
//!
//! A [`ValueMap`] is checked for bijectivity when it is declared: duplicate
//! user keys or duplicate wire tokens are rejected, so the reverse lookup on
//! the get path can never silently pick one of several candidates.

use serde::{Deserialize, Serialize};

use crate::error::{PropError, Result};
use crate::value::Value;

/// Ordered `(user value, wire token)` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(Value, Value)>", into = "Vec<(Value, Value)>")]
pub struct ValueMap {
    pairs: Vec<(Value, Value)>,
}

impl ValueMap {
    /// Build a map, rejecting duplicate keys or duplicate wire tokens.
    pub fn new<K, W>(pairs: impl IntoIterator<Item = (K, W)>) -> Result<Self>
    where
        K: Into<Value>,
        W: Into<Value>,
    {
        let mut checked: Vec<(Value, Value)> = Vec::new();
        for (user, wire) in pairs {
            let (user, wire) = (user.into(), wire.into());
            if checked.iter().any(|(u, _)| *u == user) {
                return Err(PropError::Declaration(format!(
                    "value map has duplicate key {user:?}"
                )));
            }
            if let Some((other, _)) = checked.iter().find(|(_, w)| *w == wire) {
                return Err(PropError::Declaration(format!(
                    "value map is not bijective: {other:?} and {user:?} both map to {wire:?}"
                )));
            }
            checked.push((user, wire));
        }
        Ok(Self { pairs: checked })
    }

    /// Map each entry of `values` to its position in the list.
    pub fn indexed<V: Into<Value>>(values: impl IntoIterator<Item = V>) -> Result<Self> {
        Self::new(
            values
                .into_iter()
                .enumerate()
                .map(|(index, value)| (value.into(), Value::Int(index as i64))),
        )
    }

    /// Wire token for `value`, or `value` itself when it is not a key.
    pub fn forward(&self, value: Value) -> Value {
        match self.pairs.iter().find(|(user, _)| *user == value) {
            Some((_, wire)) => wire.clone(),
            None => value,
        }
    }

    /// User value for `token`, or the raw token when it is unknown.
    pub fn reverse(&self, token: Value) -> Value {
        match self.pairs.iter().find(|(_, wire)| *wire == token) {
            Some((user, _)) => user.clone(),
            None => token,
        }
    }

    /// Whether `value` is a user-side key.
    pub fn contains_key(&self, value: &Value) -> bool {
        self.pairs.iter().any(|(user, _)| user == value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.pairs.iter().map(|(user, _)| user)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl TryFrom<Vec<(Value, Value)>> for ValueMap {
    type Error = PropError;

    fn try_from(pairs: Vec<(Value, Value)>) -> Result<Self> {
        Self::new(pairs)
    }
}

impl From<ValueMap> for Vec<(Value, Value)> {
    fn from(map: ValueMap) -> Self {
        map.pairs
    }
}

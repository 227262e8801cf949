//! Channel declarations.
//!
//! A [`ChannelClass`] is a small driver of its own: a property table whose
//! templates carry a placeholder (`{ch}` by default). A [`ChannelGroup`]
//! attaches copies of a class to a driver, one per channel id. When an
//! instrument is built, each member becomes a child instrument sharing the
//! parent's adapter, with the placeholder rendered into every template.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{PropError, Result};
use crate::property::Property;

/// Identifier substituted for the channel placeholder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelId {
    Int(i64),
    Str(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Int(i) => write!(f, "{i}"),
            ChannelId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ChannelId {
    fn from(id: i64) -> Self {
        ChannelId::Int(id)
    }
}

impl From<i32> for ChannelId {
    fn from(id: i32) -> Self {
        ChannelId::Int(id.into())
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        ChannelId::Str(id.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        ChannelId::Str(id)
    }
}

/// Property table shared by every channel of one kind.
#[derive(Debug, Clone)]
pub struct ChannelClass {
    name: String,
    placeholder: String,
    properties: BTreeMap<String, Property>,
    groups: Vec<ChannelGroup>,
}

impl ChannelClass {
    /// Class with no properties and the `ch` placeholder.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            placeholder: "ch".to_string(),
            properties: BTreeMap::new(),
            groups: Vec::new(),
        }
    }

    /// Use `{placeholder}` instead of `{ch}` in this class's templates.
    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    /// Add a property. Names must be unique within the class.
    pub fn property(mut self, property: Property) -> Result<Self> {
        let name = property.name().to_string();
        if self.properties.insert(name.clone(), property).is_some() {
            return Err(PropError::Declaration(format!(
                "channel class '{}' declares property '{name}' twice",
                self.name
            )));
        }
        Ok(self)
    }

    /// Nested channels, e.g. the outputs of one module of a mainframe.
    pub fn channels(mut self, group: ChannelGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token the channel id is rendered into.
    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    pub fn properties(&self) -> &BTreeMap<String, Property> {
        &self.properties
    }

    /// Nested channel groups.
    pub fn groups(&self) -> &[ChannelGroup] {
        &self.groups
    }
}

#[derive(Debug, Clone)]
enum Members {
    Multi { prefix: String, ids: Vec<ChannelId> },
    Single { name: String, id: ChannelId },
}

/// A set of channels of one class attached to a driver.
#[derive(Debug, Clone)]
pub struct ChannelGroup {
    class: Arc<ChannelClass>,
    members: Members,
}

impl ChannelGroup {
    /// One channel per id, named `prefix` + id (`ch_1`, `ch_2`, ...).
    pub fn multi<I: Into<ChannelId>>(
        class: impl Into<Arc<ChannelClass>>,
        ids: impl IntoIterator<Item = I>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            members: Members::Multi {
                prefix: prefix.into(),
                ids: ids.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// A single named channel.
    pub fn single(
        name: impl Into<String>,
        class: impl Into<Arc<ChannelClass>>,
        id: impl Into<ChannelId>,
    ) -> Self {
        Self {
            class: class.into(),
            members: Members::Single {
                name: name.into(),
                id: id.into(),
            },
        }
    }

    pub fn class(&self) -> &ChannelClass {
        &self.class
    }

    /// `(channel name, id)` for every member, in declaration order.
    pub fn members(&self) -> Vec<(String, ChannelId)> {
        match &self.members {
            Members::Multi { prefix, ids } => ids
                .iter()
                .map(|id| (format!("{prefix}{id}"), id.clone()))
                .collect(),
            Members::Single { name, id } => vec![(name.clone(), id.clone())],
        }
    }
}

/// Fail if two groups produce the same channel name.
pub(crate) fn check_unique_names(owner: &str, groups: &[ChannelGroup]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for (name, _) in groups.iter().flat_map(ChannelGroup::members) {
        if !seen.insert(name.clone()) {
            return Err(PropError::Declaration(format!(
                "'{owner}' declares channel '{name}' twice"
            )));
        }
    }
    groups
        .iter()
        .try_for_each(|g| check_unique_names(g.class.name(), &g.class.groups))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output() -> ChannelClass {
        ChannelClass::new("Output")
            .property(
                Property::control("voltage", "SOUR{ch}:VOLT?", "SOUR{ch}:VOLT %f", "")
                    .build()
                    .unwrap(),
            )
            .unwrap()
    }

    #[test]
    fn multi_names_use_prefix_and_id() {
        let group = ChannelGroup::multi(output(), [1, 2], "ch_");
        let names: Vec<String> = group.members().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["ch_1", "ch_2"]);
    }

    #[test]
    fn single_channel_keeps_its_name() {
        let group = ChannelGroup::single("aux", output(), "A");
        assert_eq!(group.members(), vec![("aux".to_string(), ChannelId::from("A"))]);
    }

    #[test]
    fn duplicate_properties_are_rejected() {
        let p = Property::measurement("v", "V?", "").build().unwrap();
        let err = output().property(p.clone()).unwrap().property(p).unwrap_err();
        assert!(matches!(err, PropError::Declaration(_)));
    }

    #[test]
    fn duplicate_channel_names_are_rejected() {
        let groups = [
            ChannelGroup::multi(output(), [1, 2], "ch_"),
            ChannelGroup::single("ch_2", output(), 9),
        ];
        assert!(check_unique_names("Supply", &groups).is_err());
        assert!(check_unique_names("Supply", &groups[..1]).is_ok());
    }
}

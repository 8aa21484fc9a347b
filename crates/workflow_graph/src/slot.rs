// SPDX-License-Identifier: MIT OR Apache-2.0
//! Slot definitions and the slot type system.
//!
//! A slot type is a symbolic name, the wildcard `*`, or a comma-separated
//! union of names. Two slots can be linked when their alternative sets
//! intersect (wildcards match everything).

use crate::link::LinkId;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Wildcard type, accepted by every slot
pub const WILDCARD: &str = "*";

/// Declared type of a slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SlotType(String);

impl SlotType {
    /// Create a slot type from a type name or a comma-separated union
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The wildcard type
    pub fn wildcard() -> Self {
        Self(WILDCARD.to_string())
    }

    /// Raw type string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this type accepts anything
    pub fn is_wildcard(&self) -> bool {
        let trimmed = self.0.trim();
        trimmed.is_empty() || trimmed == WILDCARD
    }

    /// Whether this type is a union of several alternatives
    pub fn is_union(&self) -> bool {
        self.0.contains(',')
    }

    /// Alternatives of this type, trimmed and without empty entries
    pub fn alternatives(&self) -> impl Iterator<Item = &str> {
        self.0.split(',').map(str::trim).filter(|alt| !alt.is_empty())
    }

    /// Check if an output of this type can feed an input of `input` type
    pub fn accepts(&self, input: &SlotType) -> bool {
        is_compatible(self, input)
    }

    /// Narrow this type by another one.
    ///
    /// Returns `None` when the two types share no alternative. The spelling
    /// of `self` is kept for the surviving alternatives.
    pub fn intersect(&self, other: &SlotType) -> Option<SlotType> {
        if self.is_wildcard() {
            return Some(other.clone());
        }
        if other.is_wildcard() {
            return Some(self.clone());
        }

        let mut kept: Vec<&str> = Vec::new();
        for alt in self.alternatives() {
            let shared = other.alternatives().any(|o| o.eq_ignore_ascii_case(alt));
            if shared && !kept.iter().any(|k| k.eq_ignore_ascii_case(alt)) {
                kept.push(alt);
            }
        }

        if kept.is_empty() {
            None
        } else {
            Some(SlotType(kept.join(",")))
        }
    }
}

impl Default for SlotType {
    fn default() -> Self {
        Self::wildcard()
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SlotType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// Older documents store event slots as numeric types (-1, 0)
impl<'de> Deserialize<'de> for SlotType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Number(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Name(name) => SlotType(name),
            Raw::Number(0) => SlotType::wildcard(),
            Raw::Number(n) => SlotType(n.to_string()),
        })
    }
}

/// Check whether an output type can be linked to an input type.
///
/// Rules, in order: a wildcard on either side matches; two plain types
/// match when equal (ASCII case-insensitive); otherwise both sides are
/// split into alternative sets and match when the sets intersect.
pub fn is_compatible(output: &SlotType, input: &SlotType) -> bool {
    if output.is_wildcard() || input.is_wildcard() {
        return true;
    }

    if !output.is_union() && !input.is_union() {
        return output.as_str().trim().eq_ignore_ascii_case(input.as_str().trim());
    }

    output
        .alternatives()
        .any(|a| input.alternatives().any(|b| a.eq_ignore_ascii_case(b)))
}

/// Slot direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotDirection {
    /// Input slot
    Input,
    /// Output slot
    Output,
}

impl fmt::Display for SlotDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Widget an input slot was converted from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotWidget {
    /// Widget name
    pub name: String,
}

/// An input slot. Holds at most one incoming link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSlot {
    /// Slot name
    pub name: String,
    /// Current type
    #[serde(rename = "type")]
    pub slot_type: SlotType,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Incoming link
    #[serde(default)]
    pub link: Option<LinkId>,
    /// Widget this input replaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<SlotWidget>,
    /// Type follows the connected peers
    #[serde(skip)]
    pub dynamic: bool,
}

impl InputSlot {
    /// Create an unconnected input
    pub fn new(name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        Self {
            name: name.into(),
            slot_type: slot_type.into(),
            label: None,
            link: None,
            widget: None,
            dynamic: false,
        }
    }

    /// Check if a link is attached
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }
}

/// An output slot. Holds any number of outgoing links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSlot {
    /// Slot name
    pub name: String,
    /// Current type
    #[serde(rename = "type")]
    pub slot_type: SlotType,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Outgoing links, in the order they were made
    #[serde(default, deserialize_with = "nullable_links")]
    pub links: Vec<LinkId>,
    /// Type follows the connected peers
    #[serde(skip)]
    pub dynamic: bool,
}

impl OutputSlot {
    /// Create an unconnected output
    pub fn new(name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        Self {
            name: name.into(),
            slot_type: slot_type.into(),
            label: None,
            links: Vec::new(),
            dynamic: false,
        }
    }

    /// Check if any link is attached
    pub fn is_connected(&self) -> bool {
        !self.links.is_empty()
    }
}

fn nullable_links<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<LinkId>, D::Error> {
    Ok(Option::<Vec<LinkId>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Slot declaration in a node kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSpec {
    /// Slot name
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub slot_type: SlotType,
    /// Effective type is computed from connected peers
    #[serde(default)]
    pub dynamic: bool,
}

impl SlotSpec {
    /// Declare a slot
    pub fn new(name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        Self {
            name: name.into(),
            slot_type: slot_type.into(),
            dynamic: false,
        }
    }

    /// Declare a dynamic slot. Its type starts as the wildcard.
    pub fn dynamic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot_type: SlotType::wildcard(),
            dynamic: true,
        }
    }

    /// Build an input slot from this declaration
    pub fn to_input(&self) -> InputSlot {
        let mut slot = InputSlot::new(self.name.clone(), self.slot_type.clone());
        slot.dynamic = self.dynamic;
        slot
    }

    /// Build an output slot from this declaration
    pub fn to_output(&self) -> OutputSlot {
        let mut slot = OutputSlot::new(self.name.clone(), self.slot_type.clone());
        slot.dynamic = self.dynamic;
        slot
    }
}

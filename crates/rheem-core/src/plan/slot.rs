//! Slots and connections
//!
//! Operators expose indexed, typed input and output slots. A connection is a
//! directed edge from an output slot to an input slot; an input slot has at
//! most one incoming connection, an output slot fans out to any number of
//! consumers.

use rheem_common::OperatorId;
use serde::{Deserialize, Serialize};

/// Coarse declared type of the data units flowing through a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataUnitType(String);

impl DataUnitType {
    pub fn of(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Wildcard type; compatible with everything.
    pub fn any() -> Self {
        Self("any".to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_compatible_with(&self, other: &DataUnitType) -> bool {
        self.0 == "any" || other.0 == "any" || self.0 == other.0
    }
}

impl std::fmt::Display for DataUnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Points at the output slot `index` of `operator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputRef {
    pub operator: OperatorId,
    pub index: usize,
}

impl OutputRef {
    pub fn new(operator: OperatorId, index: usize) -> Self {
        Self { operator, index }
    }
}

impl std::fmt::Display for OutputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[out {}]", self.operator, self.index)
    }
}

/// Points at the input slot `index` of `operator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputRef {
    pub operator: OperatorId,
    pub index: usize,
}

impl InputRef {
    pub fn new(operator: OperatorId, index: usize) -> Self {
        Self { operator, index }
    }
}

impl std::fmt::Display for InputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[in {}]", self.operator, self.index)
    }
}

/// An input slot of an operator.
#[derive(Debug, Clone)]
pub struct InputSlot {
    pub name: String,
    pub data_type: DataUnitType,
    /// Broadcast inputs receive a reusable copy of the full upstream output.
    pub broadcast: bool,
    /// The connected upstream output, if any.
    pub occupant: Option<OutputRef>,
}

impl InputSlot {
    pub fn new(name: impl Into<String>, data_type: DataUnitType) -> Self {
        Self {
            name: name.into(),
            data_type,
            broadcast: false,
            occupant: None,
        }
    }

    pub fn broadcast(name: impl Into<String>, data_type: DataUnitType) -> Self {
        Self {
            name: name.into(),
            data_type,
            broadcast: true,
            occupant: None,
        }
    }
}

/// An output slot of an operator.
#[derive(Debug, Clone)]
pub struct OutputSlot {
    pub name: String,
    pub data_type: DataUnitType,
    /// Downstream input slots fed by this output.
    pub consumers: Vec<InputRef>,
}

impl OutputSlot {
    pub fn new(name: impl Into<String>, data_type: DataUnitType) -> Self {
        Self {
            name: name.into(),
            data_type,
            consumers: Vec::new(),
        }
    }
}

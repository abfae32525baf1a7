//! Data model of the basic platform
//!
//! The basic platform processes dynamically typed values in in-memory
//! collections. UDFs are plain closures over `Value`; the core never sees
//! them, they travel as opaque payloads from the logical plan into the
//! execution operators.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A dynamically typed data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    /// Join output: (left, right).
    Pair(Box<Value>, Box<Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }
}

// Grouping keys need total equality; floats compare by bit pattern.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Int(value) => {
                1u8.hash(state);
                value.hash(state);
            }
            Value::Float(value) => {
                2u8.hash(state);
                value.to_bits().hash(state);
            }
            Value::Str(value) => {
                3u8.hash(state);
                value.hash(state);
            }
            Value::Pair(left, right) => {
                4u8.hash(state);
                left.hash(state);
                right.hash(state);
            }
        }
    }
}

impl Value {
    /// Total order for sorting: by variant, then by content; floats use
    /// `total_cmp`.
    pub fn total_cmp(&self, other: &Value) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        use Value::*;
        let rank = |value: &Value| match value {
            Null => 0,
            Int(_) => 1,
            Float(_) => 2,
            Str(_) => 3,
            Pair(_, _) => 4,
        };
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Str(a), Str(b)) => a.cmp(b),
            (Pair(a1, a2), Pair(b1, b2)) => a1.total_cmp(b1).then_with(|| a2.total_cmp(b2)),
            (a, b) => rank(a).cmp(&rank(b)).then(Ordering::Equal),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

/// The collection payload flowing through basic channels.
pub type Dataset = Vec<Value>;

pub type UnaryFunction = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type BinaryFunction = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;
pub type KeyFunction = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type FlatMapFunction = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

// Opaque payloads the logical plan carries for the mappings.

pub struct SourceDescriptor {
    pub values: Dataset,
}

pub struct MapDescriptor {
    pub function: UnaryFunction,
}

pub struct FilterDescriptor {
    pub predicate: Predicate,
}

pub struct FlatMapDescriptor {
    pub function: FlatMapFunction,
}

pub struct ReduceDescriptor {
    pub function: BinaryFunction,
}

pub struct ReduceByDescriptor {
    pub key: KeyFunction,
    pub function: BinaryFunction,
}

pub struct JoinDescriptor {
    pub left_key: KeyFunction,
    pub right_key: KeyFunction,
}

pub struct SampleDescriptor {
    pub size: u64,
}

pub struct SinkDescriptor {
    pub collector: std::sync::Arc<parking_lot::Mutex<Dataset>>,
}

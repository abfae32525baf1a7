//! Rheem Common - Shared types, errors, configuration and estimate algebra

pub mod config;
pub mod error;
pub mod estimate;
pub mod types;

pub use config::Configuration;
pub use error::{Result, RheemError};
pub use estimate::{
    CardinalityEstimate, LoadEstimate, ProbabilisticDoubleInterval, TimeEstimate,
};
pub use types::{ChannelId, JobId, OperatorId, PlatformId, StageId, TaskId};

//! Rheem Basic - the platform-neutral operator vocabulary and the default
//! in-process "basic" platform.

pub mod data;
pub mod mapping;
pub mod operators;
pub mod platform;

pub use data::{Dataset, Value};
pub use mapping::register_basic;
pub use operators::{DataFlow, PlanBuilder};
pub use platform::{BasicExecutor, BasicPlatform, BASIC_PLATFORM, COLLECTION_CHANNEL};

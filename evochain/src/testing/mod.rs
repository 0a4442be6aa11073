//! Test helpers: a scriptable generation service and image tree fixtures.

mod fixtures;
mod service;

pub use fixtures::ImageTree;
pub use service::{ScriptedService, ServiceCall};

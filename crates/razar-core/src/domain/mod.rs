//! Domain types: component definitions, lifecycle states, error taxonomy.

pub mod component;
pub mod error;
pub mod state;

pub use component::{
    load_config, parse_config, BootConfig, CapabilityRequirement, ComponentDef, ProbeSpec,
};
pub use error::{RazarError, Result};
pub use state::{ComponentLifecycle, ComponentState};

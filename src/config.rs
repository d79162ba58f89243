//! Host configuration.
//!
//! ## Environment Variables
//!
//! - `WEAKREFS_EXPOSE_GC`: `"0"` or `"false"` hides the manual GC trigger
//! - `WEAKREFS_DISABLE`: comma-separated implementations to treat as unavailable
//!   (`native`, `stub`, `shim`)
//! - `WEAKREFS_SURVIVOR_PASSES`: number of collections an unreachable registered
//!   object must be seen dead before it is reclaimed (default: 1)
use crate::{
    error::{Error, Result},
    registry::Implementation,
};
use std::env;

pub const EXPOSE_GC_VAR: &str = "WEAKREFS_EXPOSE_GC";
pub const DISABLE_VAR: &str = "WEAKREFS_DISABLE";
pub const SURVIVOR_PASSES_VAR: &str = "WEAKREFS_SURVIVOR_PASSES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Whether the heap hands out a manual GC trigger.
    pub expose_gc: bool,
    pub disabled: Vec<Implementation>,
    pub survivor_passes: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            expose_gc: true,
            disabled: Vec::new(),
            survivor_passes: 1,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = lookup(EXPOSE_GC_VAR) {
            config.expose_gc = match val.trim().to_ascii_lowercase().as_str() {
                "" | "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(Error::InvalidConfig(format!(
                        "{EXPOSE_GC_VAR}: expected a boolean, got {other:?}"
                    )))
                }
            };
        }

        if let Some(val) = lookup(DISABLE_VAR) {
            for name in val.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let implementation: Implementation = name.parse()?;
                if !config.disabled.contains(&implementation) {
                    config.disabled.push(implementation);
                }
            }
        }

        if let Some(val) = lookup(SURVIVOR_PASSES_VAR) {
            config.survivor_passes = match val.trim().parse::<u32>() {
                Ok(0) | Err(_) => {
                    return Err(Error::InvalidConfig(format!(
                        "{SURVIVOR_PASSES_VAR}: expected a positive integer, got {val:?}"
                    )))
                }
                Ok(n) => n,
            };
        }

        Ok(config)
    }

    pub fn is_disabled(&self, implementation: Implementation) -> bool {
        self.disabled.contains(&implementation)
    }

    pub fn with_survivor_passes(mut self, passes: u32) -> Self {
        self.survivor_passes = passes.max(1);
        self
    }

    pub fn without(mut self, implementation: Implementation) -> Self {
        if !self.is_disabled(implementation) {
            self.disabled.push(implementation);
        }
        self
    }
}

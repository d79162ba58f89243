//! Capability probing.
//!
//! Availability is computed once from a [`HostConfig`] and never changes
//! afterwards. The flags are plain values so callers (and tests) can construct
//! whatever host they need instead of relying on process-wide state.
use crate::{
    config::HostConfig,
    error::{Error, Result},
    registry::Implementation,
};
use std::sync::OnceLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The host exposes a manual GC trigger.
    pub gc_available: bool,
    pub native_available: bool,
    pub stub_available: bool,
    pub shim_available: bool,
}

impl Capabilities {
    pub fn probe(config: &HostConfig) -> Self {
        let available = |i: Implementation| i.compiled_in() && !config.is_disabled(i);
        Self {
            gc_available: config.expose_gc,
            native_available: available(Implementation::Native),
            stub_available: available(Implementation::Stub),
            shim_available: available(Implementation::Shim),
        }
    }

    /// Capabilities of this process, probed from the environment on first use.
    pub fn detect() -> &'static Capabilities {
        static DETECTED: OnceLock<Capabilities> = OnceLock::new();
        DETECTED.get_or_init(|| {
            let config = HostConfig::from_env().unwrap_or_else(|e| {
                warn!("{e}; probing with the default host configuration");
                HostConfig::default()
            });
            Capabilities::probe(&config)
        })
    }

    pub fn is_available(&self, implementation: Implementation) -> bool {
        match implementation {
            Implementation::Native => self.native_available,
            Implementation::Stub => self.stub_available,
            Implementation::Shim => self.shim_available,
        }
    }

    pub fn weakrefs_available(&self) -> bool {
        Implementation::ALL.into_iter().any(|i| self.is_available(i))
    }

    pub fn available(&self) -> impl Iterator<Item = Implementation> + '_ {
        Implementation::ALL
            .into_iter()
            .filter(|&i| self.is_available(i))
    }

    fn first_of(&self, order: [Implementation; 3]) -> Result<Implementation> {
        order
            .into_iter()
            .find(|&i| self.is_available(i))
            .ok_or(Error::ImplementationNotAvailable)
    }

    /// The platform primitive to test: native, else stub, else shim.
    pub fn select(&self) -> Result<Implementation> {
        self.first_of([
            Implementation::Native,
            Implementation::Stub,
            Implementation::Shim,
        ])
    }

    /// The library's default pick: native, else the portable shim, else stub.
    pub fn select_any(&self) -> Result<Implementation> {
        self.first_of([
            Implementation::Native,
            Implementation::Shim,
            Implementation::Stub,
        ])
    }

    pub fn require(&self, implementation: Implementation) -> Result<Implementation> {
        if self.is_available(implementation) {
            Ok(implementation)
        } else {
            Err(Error::ImplementationDisabled(implementation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(native: bool, stub: bool, shim: bool) -> Capabilities {
        Capabilities {
            gc_available: true,
            native_available: native,
            stub_available: stub,
            shim_available: shim,
        }
    }

    #[test]
    fn test_selection_order() {
        assert_eq!(caps(true, true, true).select(), Ok(Implementation::Native));
        assert_eq!(caps(false, true, true).select(), Ok(Implementation::Stub));
        assert_eq!(caps(false, false, true).select(), Ok(Implementation::Shim));
        assert_eq!(
            caps(false, false, false).select(),
            Err(Error::ImplementationNotAvailable)
        );
    }

    #[test]
    fn test_default_pick_prefers_shim_over_stub() {
        assert_eq!(caps(false, true, true).select_any(), Ok(Implementation::Shim));
        assert_eq!(caps(false, true, false).select_any(), Ok(Implementation::Stub));
        assert_eq!(caps(true, true, true).select_any(), Ok(Implementation::Native));
    }

    #[test]
    fn test_probe_honours_config() {
        let config = HostConfig {
            expose_gc: false,
            ..HostConfig::default()
        }
        .without(Implementation::Native);
        let probed = Capabilities::probe(&config);

        assert!(!probed.gc_available);
        assert!(!probed.native_available);
        assert_eq!(probed.stub_available, cfg!(feature = "stub"));
        assert_eq!(probed.shim_available, cfg!(feature = "shim"));
        assert_eq!(
            probed.require(Implementation::Native),
            Err(Error::ImplementationDisabled(Implementation::Native))
        );
    }

    #[test]
    fn test_detect_is_cached_for_the_process() {
        let first = Capabilities::detect();
        let second = Capabilities::detect();

        assert!(std::ptr::eq(first, second));
        let config = HostConfig::from_env().unwrap_or_default();
        assert_eq!(*first, Capabilities::probe(&config));
    }

    #[test]
    fn test_nothing_available() {
        let probed = caps(false, false, false);
        assert!(!probed.weakrefs_available());
        assert_eq!(probed.available().count(), 0);
    }
}

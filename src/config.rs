//! Runtime knobs for an emulation session, separate from the [`crate::device::Device`]
//! declaration itself since they describe how to run a device rather than
//! what it is.

use std::env;

/// Groups the handful of settings that vary between runs of the same
/// declared device: which backend to present it through, and how chatty
/// logging should be. Construct with [`EmulationConfig::from_env`] for the
/// common case of a binary that wants `BACKEND`/verbosity controlled from
/// outside the process, or build one directly for programmatic control
/// (tests, a harness that always wants the `vhci` backend regardless of
/// environment).
#[derive(Debug, Clone, Default)]
pub struct EmulationConfig {
    /// Selects a backend by name, mirroring the `BACKEND` environment
    /// variable (see [`crate::backend::resolve`]). `None` autodetects
    /// across the registered backends in registration order.
    pub backend: Option<String>,
    /// 0 = warn, 1 = info, 2 = debug, 3+ = trace. Applied to the global log
    /// level at [`crate::device::Device::connect`] time.
    pub verbose: u8,
}

impl EmulationConfig {
    pub fn from_env() -> Self {
        Self {
            backend: env::var("BACKEND").ok().filter(|s| !s.is_empty()),
            verbose: env::var("USBEMU_VERBOSE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_increasingly_chatty_levels() {
        assert_eq!(
            EmulationConfig { backend: None, verbose: 0 }.log_level(),
            log::LevelFilter::Warn
        );
        assert_eq!(
            EmulationConfig { backend: None, verbose: 3 }.log_level(),
            log::LevelFilter::Trace
        );
    }
}

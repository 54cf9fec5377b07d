// ── Device registry ──
//
// Handles keyed by device name. Iteration order is the sorted name
// order, which is also the transaction engine's device ordering.
// Handles are created on first connect and never discarded during a
// session, so CLOSED devices keep their diagnostics observable.

use std::collections::BTreeMap;

use globset::Glob;

use fleetconf_netconf::FramingMode;

use crate::device::handle::DeviceHandle;
use crate::error::CoreError;
use crate::model::device::{DeviceConfig, DeviceSummary};

#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceHandle>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DeviceHandle> {
        self.devices.get_mut(name)
    }

    /// Handle for a configured device, created on first use.
    pub fn ensure(&mut self, config: &DeviceConfig, framing: FramingMode) -> &mut DeviceHandle {
        self.devices
            .entry(config.name.clone())
            .or_insert_with(|| DeviceHandle::new(config.clone(), framing))
    }

    /// Names of registered devices matching a glob pattern, sorted.
    pub fn matching(&self, pattern: &str) -> Result<Vec<String>, CoreError> {
        let glob = Glob::new(pattern)
            .map_err(|_| CoreError::InvalidPattern {
                pattern: pattern.to_string(),
            })?
            .compile_matcher();
        Ok(self
            .devices
            .keys()
            .filter(|name| glob.is_match(name.as_str()))
            .cloned()
            .collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices.values()
    }

    pub fn summaries(&self) -> Vec<DeviceSummary> {
        self.devices.values().map(DeviceHandle::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::device::ConnState;

    fn registry_with(names: &[&str]) -> DeviceRegistry {
        let mut reg = DeviceRegistry::new();
        for name in names {
            reg.ensure(&DeviceConfig::new(*name, "10.0.0.1"), FramingMode::Eom);
        }
        reg
    }

    #[test]
    fn glob_matches_subset_in_sorted_order() {
        let reg = registry_with(&["dev2", "other", "dev1"]);
        let names = reg.matching("dev*").unwrap();
        assert_eq!(names, vec!["dev1", "dev2"]);
        assert_eq!(reg.matching("*").unwrap().len(), 3);
        assert!(reg.matching("nope*").unwrap().is_empty());
    }

    #[test]
    fn closed_handles_are_retained() {
        let mut reg = registry_with(&["r1"]);
        let h = reg.get_mut("r1").unwrap();
        h.set_state(ConnState::Connecting);
        h.close(Some("No method to get schemas".to_string()));
        let summary = &reg.summaries()[0];
        assert!(summary.state.is_closed());
        assert_eq!(summary.logmsg.as_deref(), Some("No method to get schemas"));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let reg = registry_with(&["r1"]);
        assert!(matches!(
            reg.matching("[unclosed"),
            Err(CoreError::InvalidPattern { .. })
        ));
    }
}

//! Companion connectivity probe.
//!
//! The probe answers one question, "is the companion linked right now?", and
//! never fails: anything it cannot determine counts as disconnected, so the
//! relay errs toward showing a message rather than dropping it.
//!
//! Platform access is split in two capabilities. [`WirelessSubsystem`] is the
//! documented path (BlueZ's `bluetoothctl`). [`LinkStateFallback`] is an
//! optional privileged query (`hcitool con`) consulted only when the
//! documented path cannot report a link state. Both are injected at startup
//! so tests run against fakes.

use crate::common::command::{run_tool, TOOL_TIMEOUT};
use crate::common::config::is_valid_address;
use crate::common::error::{RelayError, Result};
use tracing::debug;

/// Answers whether the companion device is currently linked.
pub trait ConnectivityProbe: Send + Sync {
    fn is_companion_connected(&self, address: &str) -> bool;
}

/// Local radio controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHandle {
    pub address: String,
}

/// Remote device as seen through an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
}

/// Documented wireless subsystem API.
pub trait WirelessSubsystem: Send + Sync {
    /// The default radio, or `None` when the host has no radio.
    fn default_adapter(&self) -> Result<Option<AdapterHandle>>;
    fn is_enabled(&self, adapter: &AdapterHandle) -> Result<bool>;
    fn remote_device(&self, adapter: &AdapterHandle, address: &str) -> Result<DeviceHandle>;
    /// Link state of a device. May be unavailable for devices the subsystem
    /// has no record of.
    fn link_state(&self, device: &DeviceHandle) -> Result<bool>;
}

/// Privileged link-state query used when the documented one has no answer.
pub trait LinkStateFallback: Send + Sync {
    fn is_connected(&self, device: &DeviceHandle) -> Result<bool>;
}

/// Probe backed by the host's wireless subsystem.
pub struct SystemProbe {
    subsystem: Box<dyn WirelessSubsystem>,
    fallback: Option<Box<dyn LinkStateFallback>>,
}

impl SystemProbe {
    pub fn new(subsystem: Box<dyn WirelessSubsystem>) -> Self {
        Self {
            subsystem,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn LinkStateFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// BlueZ command-line tools, with `hcitool` as the fallback.
    pub fn bluez() -> Self {
        Self::new(Box::new(Bluetoothctl)).with_fallback(Box::new(HcitoolFallback))
    }

    fn query(&self, address: &str) -> Result<bool> {
        let Some(adapter) = self.subsystem.default_adapter()? else {
            debug!("No wireless adapter present");
            return Ok(false);
        };
        if !self.subsystem.is_enabled(&adapter)? {
            debug!(adapter = %adapter.address, "Wireless adapter disabled");
            return Ok(false);
        }

        let device = self.subsystem.remote_device(&adapter, address)?;
        match self.subsystem.link_state(&device) {
            Ok(connected) => Ok(connected),
            Err(primary) => match &self.fallback {
                Some(fallback) => {
                    debug!(error = %primary, "Link state unavailable, trying fallback");
                    fallback.is_connected(&device)
                }
                None => Err(primary),
            },
        }
    }
}

impl ConnectivityProbe for SystemProbe {
    fn is_companion_connected(&self, address: &str) -> bool {
        if address.is_empty() {
            return false;
        }
        match self.query(address) {
            Ok(connected) => connected,
            Err(err) => {
                debug!(address, error = %err, "Probe failed, treating companion as disconnected");
                false
            }
        }
    }
}

// ============================================================================
// BlueZ command-line backends
// ============================================================================

/// `bluetoothctl` (BlueZ).
pub struct Bluetoothctl;

impl WirelessSubsystem for Bluetoothctl {
    fn default_adapter(&self) -> Result<Option<AdapterHandle>> {
        let output = run_tool("bluetoothctl", &["list"], TOOL_TIMEOUT)?;
        Ok(parse_default_controller(&output).map(|address| AdapterHandle { address }))
    }

    fn is_enabled(&self, adapter: &AdapterHandle) -> Result<bool> {
        let output = run_tool("bluetoothctl", &["show", adapter.address.as_str()], TOOL_TIMEOUT)?;
        Ok(parse_yes_no_field(&output, "Powered").unwrap_or(false))
    }

    fn remote_device(&self, _adapter: &AdapterHandle, address: &str) -> Result<DeviceHandle> {
        if !is_valid_address(address) {
            return Err(RelayError::InvalidAddress(address.to_string()));
        }
        Ok(DeviceHandle {
            address: address.to_uppercase(),
        })
    }

    fn link_state(&self, device: &DeviceHandle) -> Result<bool> {
        let output = run_tool("bluetoothctl", &["info", device.address.as_str()], TOOL_TIMEOUT)?;
        parse_yes_no_field(&output, "Connected").ok_or_else(|| RelayError::LinkStateUnavailable {
            address: device.address.clone(),
            reason: "device not known to bluetoothctl".to_string(),
        })
    }
}

/// `hcitool con`, which lists active links but needs elevated privileges on
/// most systems.
pub struct HcitoolFallback;

impl LinkStateFallback for HcitoolFallback {
    fn is_connected(&self, device: &DeviceHandle) -> Result<bool> {
        let output = run_tool("hcitool", &["con"], TOOL_TIMEOUT)?;
        Ok(connection_list_contains(&output, &device.address))
    }
}

/// Pick the default controller from `bluetoothctl list` output, else the first.
///
/// Lines look like `Controller 00:1A:7D:DA:71:13 host [default]`.
fn parse_default_controller(output: &str) -> Option<String> {
    let controllers: Vec<(&str, bool)> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next()? != "Controller" {
                return None;
            }
            let address = parts.next()?;
            Some((address, line.contains("[default]")))
        })
        .collect();

    controllers
        .iter()
        .find(|(_, is_default)| *is_default)
        .or_else(|| controllers.first())
        .map(|(address, _)| address.to_string())
}

/// Read a `Field: yes|no` line from `bluetoothctl show/info` output.
fn parse_yes_no_field(output: &str, field: &str) -> Option<bool> {
    output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if key.trim() != field {
            return None;
        }
        match value.trim() {
            "yes" => Some(true),
            "no" => Some(false),
            _ => None,
        }
    })
}

/// Whether `hcitool con` output lists a link to `address`.
///
/// Lines look like `< ACL 00:11:22:33:44:55 handle 11 state 1 lm MASTER`.
fn connection_list_contains(output: &str, address: &str) -> bool {
    output.lines().any(|line| {
        line.split_whitespace()
            .any(|token| token.eq_ignore_ascii_case(address))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    #[derive(Clone)]
    struct FakeSubsystem {
        adapter: Option<&'static str>,
        enabled: bool,
        link: std::result::Result<bool, &'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeSubsystem {
        fn linked(connected: bool) -> Self {
            Self {
                adapter: Some("00:1A:7D:DA:71:13"),
                enabled: true,
                link: Ok(connected),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl WirelessSubsystem for FakeSubsystem {
        fn default_adapter(&self) -> Result<Option<AdapterHandle>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.adapter.map(|a| AdapterHandle {
                address: a.to_string(),
            }))
        }

        fn is_enabled(&self, _adapter: &AdapterHandle) -> Result<bool> {
            Ok(self.enabled)
        }

        fn remote_device(&self, _adapter: &AdapterHandle, address: &str) -> Result<DeviceHandle> {
            Ok(DeviceHandle {
                address: address.to_string(),
            })
        }

        fn link_state(&self, device: &DeviceHandle) -> Result<bool> {
            self.link.map_err(|reason| RelayError::LinkStateUnavailable {
                address: device.address.clone(),
                reason: reason.to_string(),
            })
        }
    }

    struct FakeFallback(std::result::Result<bool, &'static str>);

    impl LinkStateFallback for FakeFallback {
        fn is_connected(&self, _device: &DeviceHandle) -> Result<bool> {
            self.0
                .map_err(|details| RelayError::command_failed("hcitool", details))
        }
    }

    #[test]
    fn test_reports_link_state() {
        assert!(SystemProbe::new(Box::new(FakeSubsystem::linked(true))).is_companion_connected(ADDR));
        assert!(!SystemProbe::new(Box::new(FakeSubsystem::linked(false))).is_companion_connected(ADDR));
    }

    #[test]
    fn test_empty_address_never_touches_platform() {
        let fake = FakeSubsystem::linked(true);
        let calls = fake.calls.clone();
        let probe = SystemProbe::new(Box::new(fake));
        assert!(!probe.is_companion_connected(""));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_or_disabled_radio_is_disconnected() {
        let mut absent = FakeSubsystem::linked(true);
        absent.adapter = None;
        assert!(!SystemProbe::new(Box::new(absent)).is_companion_connected(ADDR));

        let mut disabled = FakeSubsystem::linked(true);
        disabled.enabled = false;
        assert!(!SystemProbe::new(Box::new(disabled)).is_companion_connected(ADDR));
    }

    #[test]
    fn test_fallback_answers_when_primary_cannot() {
        let mut fake = FakeSubsystem::linked(false);
        fake.link = Err("unknown device");
        let probe = SystemProbe::new(Box::new(fake)).with_fallback(Box::new(FakeFallback(Ok(true))));
        assert!(probe.is_companion_connected(ADDR));
    }

    #[test]
    fn test_fallback_not_consulted_when_primary_answers() {
        let probe = SystemProbe::new(Box::new(FakeSubsystem::linked(false)))
            .with_fallback(Box::new(FakeFallback(Ok(true))));
        assert!(!probe.is_companion_connected(ADDR));
    }

    #[test]
    fn test_errors_fail_closed() {
        let mut fake = FakeSubsystem::linked(true);
        fake.link = Err("unknown device");
        let no_fallback = SystemProbe::new(Box::new(fake.clone()));
        assert!(!no_fallback.is_companion_connected(ADDR));

        let failing_fallback =
            SystemProbe::new(Box::new(fake)).with_fallback(Box::new(FakeFallback(Err("permission denied"))));
        assert!(!failing_fallback.is_companion_connected(ADDR));
    }

    /// Subsystem whose link-state tool never answers on its own.
    struct WedgedSubsystem;

    impl WirelessSubsystem for WedgedSubsystem {
        fn default_adapter(&self) -> Result<Option<AdapterHandle>> {
            Ok(Some(AdapterHandle {
                address: "00:1A:7D:DA:71:13".to_string(),
            }))
        }

        fn is_enabled(&self, _adapter: &AdapterHandle) -> Result<bool> {
            Ok(true)
        }

        fn remote_device(&self, _adapter: &AdapterHandle, address: &str) -> Result<DeviceHandle> {
            Ok(DeviceHandle {
                address: address.to_string(),
            })
        }

        fn link_state(&self, _device: &DeviceHandle) -> Result<bool> {
            run_tool("sleep", &["30"], std::time::Duration::from_millis(100)).map(|_| true)
        }
    }

    #[test]
    fn test_wedged_tool_reports_disconnected() {
        let start = std::time::Instant::now();
        let probe = SystemProbe::new(Box::new(WedgedSubsystem));
        assert!(!probe.is_companion_connected(ADDR));
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_bluetoothctl_rejects_malformed_address() {
        let adapter = AdapterHandle {
            address: "00:1A:7D:DA:71:13".to_string(),
        };
        assert!(matches!(
            Bluetoothctl.remote_device(&adapter, "not-an-address"),
            Err(RelayError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_parse_default_controller() {
        let output = "Controller 11:11:11:11:11:11 usb-dongle\nController 00:1A:7D:DA:71:13 laptop [default]\n";
        assert_eq!(
            parse_default_controller(output).as_deref(),
            Some("00:1A:7D:DA:71:13")
        );
        assert_eq!(
            parse_default_controller("Controller 11:11:11:11:11:11 only\n").as_deref(),
            Some("11:11:11:11:11:11")
        );
        assert_eq!(parse_default_controller(""), None);
    }

    #[test]
    fn test_parse_yes_no_field() {
        let info = "Device AA:BB:CC:DD:EE:FF (public)\n\tName: Band 7\n\tPaired: yes\n\tConnected: no\n";
        assert_eq!(parse_yes_no_field(info, "Connected"), Some(false));
        assert_eq!(parse_yes_no_field(info, "Paired"), Some(true));
        assert_eq!(parse_yes_no_field(info, "Powered"), None);
        assert_eq!(
            parse_yes_no_field("Device AA:BB:CC:DD:EE:FF not available\n", "Connected"),
            None
        );
    }

    #[test]
    fn test_connection_list_contains() {
        let output = "Connections:\n\t< ACL aa:bb:cc:dd:ee:ff handle 11 state 1 lm MASTER\n";
        assert!(connection_list_contains(output, ADDR));
        assert!(!connection_list_contains(output, "11:22:33:44:55:66"));
        assert!(!connection_list_contains("Connections:\n", ADDR));
    }
}

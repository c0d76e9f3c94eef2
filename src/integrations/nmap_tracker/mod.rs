//! Network presence tracking with nmap.
//!
//! Each configured registration (config entry) owns one [`NmapDeviceScanner`]
//! polling its host list. Devices are shared process-wide in
//! [`NmapTrackedDevices`]: the first registration that sees a hardware
//! address owns it. Scanners announce devices on the dispatcher and the
//! `device_tracker` platform turns those announcements into entities.

pub mod device_tracker;
pub mod mac;
pub mod nmap;
pub mod scanner;
pub mod vendor;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::config::ensure_list_csv;
use crate::error::ConfigError;

pub use scanner::NmapDeviceScanner;

pub const DOMAIN: &str = "nmap_tracker";

/// Default scan interval in seconds.
pub const TRACKER_SCAN_INTERVAL: u64 = 120;
pub const DEFAULT_OPTIONS: &str = "-F -T4 --min-rate 10 --host-timeout 5s";

/// Some nmap builds abort with
/// `Assertion failed: htn.toclock_running == true (Target.cc: stopTimeOutClock: 503)`.
pub const NMAP_TRANSIENT_FAILURE: &str = "Assertion failed: htn.toclock_running == true";
pub const MAX_SCAN_ATTEMPTS: usize = 16;
pub const OFFLINE_SCANS_TO_MARK_UNAVAILABLE: u32 = 3;

/// One registration of the tracker.
#[derive(Debug, Clone, Deserialize)]
pub struct NmapEntryConfig {
    pub entry_id: String,
    /// Comma-separated targets (addresses, ranges, CIDR blocks).
    pub hosts: String,
    /// Comma-separated targets never to scan.
    #[serde(default)]
    pub exclude: String,
    /// Extra nmap arguments.
    #[serde(default = "default_options")]
    pub options: String,
    /// Minutes a device seen "up" is left out of active scans. 0 disables.
    #[serde(default)]
    pub home_interval: u64,
    /// Seconds between scans.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    /// Track addresses this registration has never seen before.
    #[serde(default = "default_true")]
    pub track_new_devices: bool,
}

fn default_options() -> String {
    DEFAULT_OPTIONS.to_string()
}

fn default_scan_interval() -> u64 {
    TRACKER_SCAN_INTERVAL
}

fn default_true() -> bool {
    true
}

impl NmapEntryConfig {
    pub fn new(entry_id: &str, hosts: &str) -> Self {
        Self {
            entry_id: entry_id.to_string(),
            hosts: hosts.to_string(),
            exclude: String::new(),
            options: default_options(),
            home_interval: 0,
            scan_interval: TRACKER_SCAN_INTERVAL,
            track_new_devices: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_list().is_empty() {
            return Err(ConfigError::Invalid {
                entry_id: self.entry_id.clone(),
                field: "hosts",
                message: "at least one host is required".to_string(),
            });
        }
        if self.scan_interval == 0 {
            return Err(ConfigError::Invalid {
                entry_id: self.entry_id.clone(),
                field: "scan_interval",
                message: "must be a positive number of seconds".to_string(),
            });
        }
        Ok(())
    }

    pub fn host_list(&self) -> Vec<String> {
        ensure_list_csv(&self.hosts)
    }

    pub fn exclude_list(&self) -> Vec<String> {
        ensure_list_csv(&self.exclude)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn home_interval(&self) -> Option<chrono::Duration> {
        match self.home_interval {
            0 => None,
            minutes => Some(chrono::Duration::minutes(minutes as i64)),
        }
    }
}

/// A device known to the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NmapDevice {
    pub mac_address: String,
    pub hostname: Option<String>,
    pub name: String,
    pub ipv4: Option<String>,
    pub manufacturer: Option<String>,
    pub reason: String,
    pub last_update: DateTime<Utc>,
    pub offline_scans: u32,
}

/// Devices shared by every registration.
#[derive(Default)]
pub struct NmapTrackedDevices {
    /// mac -> device
    pub tracked: DashMap<String, NmapDevice>,
    /// last seen address -> mac
    pub ipv4_last_mac: DashMap<String, String>,
    /// mac -> owning entry id
    pub config_entry_owner: DashMap<String, String>,
}

impl NmapTrackedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mac: &str) -> Option<NmapDevice> {
        self.tracked.get(mac).map(|d| d.value().clone())
    }

    /// Claim `mac` for `entry_id` unless another entry already owns it.
    /// Returns whether `entry_id` is the owner afterwards.
    pub fn claim(&self, mac: &str, entry_id: &str) -> bool {
        let owner = self
            .config_entry_owner
            .entry(mac.to_string())
            .or_insert_with(|| entry_id.to_string());
        owner.value() == entry_id
    }

    /// Forget every device owned by `entry_id`. Returns the removed MACs.
    pub fn untrack_entry(&self, entry_id: &str) -> Vec<String> {
        let owned: Vec<String> = self
            .config_entry_owner
            .iter()
            .filter(|e| e.value() == entry_id)
            .map(|e| e.key().clone())
            .collect();

        for mac in &owned {
            if let Some((_, device)) = self.tracked.remove(mac) {
                if let Some(ipv4) = device.ipv4 {
                    self.ipv4_last_mac.remove(&ipv4);
                }
            }
            self.config_entry_owner.remove(mac);
        }
        owned
    }

    pub fn devices_for_entry(&self, entry_id: &str) -> Vec<NmapDevice> {
        let mut devices: Vec<NmapDevice> = self
            .config_entry_owner
            .iter()
            .filter(|e| e.value() == entry_id)
            .filter_map(|e| self.get(e.key()))
            .collect();
        devices.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
        devices
    }
}

// ── Signals ────────────────────────────────────────────────

pub fn signal_device_new(entry_id: &str) -> String {
    format!("{}-device-new-{}", DOMAIN, entry_id)
}

pub fn signal_device_missing(entry_id: &str) -> String {
    format!("{}-device-missing-{}", DOMAIN, entry_id)
}

pub fn signal_device_update(mac_address: &str) -> String {
    format!("{}-device-update-{}", DOMAIN, mac_address)
}

// ── Naming ─────────────────────────────────────────────────

/// The first label of a hostname.
pub fn short_hostname(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

pub fn human_readable_name(hostname: Option<&str>, vendor: Option<&str>, mac_address: &str) -> String {
    if let Some(hostname) = hostname.filter(|h| !h.is_empty()) {
        return short_hostname(hostname).to_string();
    }
    if let Some(vendor) = vendor.filter(|v| !v.is_empty()) {
        return format!("{} {}", vendor, mac_tail(mac_address));
    }
    format!("Nmap Tracker {}", mac_address)
}

/// Last eight characters of an address (`12:34:56` for a formatted MAC).
fn mac_tail(mac_address: &str) -> &str {
    match mac_address.char_indices().rev().nth(7) {
        Some((start, _)) => &mac_address[start..],
        None => mac_address,
    }
}

// ── Registration lifecycle ─────────────────────────────────

struct LoadedEntry {
    scanner: Arc<NmapDeviceScanner>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Owns every nmap_tracker registration of the process.
pub struct NmapTracker {
    app: Arc<AppState>,
    devices: Arc<NmapTrackedDevices>,
    vendors: Arc<vendor::MacVendorLookup>,
    port_scanner: Arc<dyn nmap::PortScanner>,
    mac_resolver: Arc<dyn mac::MacResolver>,
    entries: DashMap<String, LoadedEntry>,
}

impl NmapTracker {
    pub fn new(
        app: Arc<AppState>,
        vendors: Arc<vendor::MacVendorLookup>,
        port_scanner: Arc<dyn nmap::PortScanner>,
        mac_resolver: Arc<dyn mac::MacResolver>,
    ) -> Self {
        Self {
            devices: app.nmap_devices.clone(),
            app,
            vendors,
            port_scanner,
            mac_resolver,
            entries: DashMap::new(),
        }
    }

    pub fn devices(&self) -> Arc<NmapTrackedDevices> {
        self.devices.clone()
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Set up a registration: build its scanner, start the entity platform
    /// and the scan interval.
    pub fn setup_entry(&self, config: &NmapEntryConfig) -> Result<Arc<NmapDeviceScanner>, ConfigError> {
        config.validate()?;
        if self.entries.contains_key(&config.entry_id) {
            self.unload_entry(&config.entry_id);
        }

        let known = self.known_mac_addresses(&config.entry_id);
        let scanner = Arc::new(NmapDeviceScanner::new(
            config,
            self.devices.clone(),
            self.app.dispatcher.clone(),
            self.port_scanner.clone(),
            self.mac_resolver.clone(),
            self.vendors.clone(),
            known,
        ));

        // Entity platform connects before the first scan can announce anything.
        let platform = device_tracker::start_platform(self.app.clone(), self.devices.clone(), &config.entry_id);
        let interval = scanner::start_scan_interval(scanner.clone());

        tracing::info!(
            entry_id = %config.entry_id,
            hosts = ?config.host_list(),
            interval_secs = config.scan_interval,
            "nmap_tracker registration set up"
        );

        self.entries.insert(
            config.entry_id.clone(),
            LoadedEntry {
                scanner: scanner.clone(),
                tasks: vec![platform, interval],
            },
        );
        Ok(scanner)
    }

    /// Stop a registration and forget the devices it owns.
    pub fn unload_entry(&self, entry_id: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(entry_id) else {
            return false;
        };
        entry.scanner.stop();
        for task in entry.tasks {
            task.abort();
        }

        let removed = self.devices.untrack_entry(entry_id);
        let dispatcher = &self.app.dispatcher;
        dispatcher.disconnect(&signal_device_new(entry_id));
        dispatcher.disconnect(&signal_device_missing(entry_id));
        for mac in &removed {
            dispatcher.disconnect(&signal_device_update(mac));
        }

        tracing::info!(entry_id, removed = removed.len(), "nmap_tracker registration unloaded");
        true
    }

    /// Apply new options by reloading the registration.
    pub fn reload_entry(&self, config: &NmapEntryConfig) -> Result<Arc<NmapDeviceScanner>, ConfigError> {
        self.unload_entry(&config.entry_id);
        self.setup_entry(config)
    }

    /// MAC -> original name of the entities this entry registered in earlier runs.
    fn known_mac_addresses(&self, entry_id: &str) -> std::collections::HashMap<String, Option<String>> {
        match self.app.entity_registry.entries_for_config_entry(entry_id) {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.platform == DOMAIN)
                .map(|e| (e.unique_id, e.original_name))
                .collect(),
            Err(e) => {
                tracing::warn!(entry_id, "Failed to read known devices from entity registry: {}", e);
                Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(mac: &str, ip: Option<&str>) -> NmapDevice {
        NmapDevice {
            mac_address: mac.to_string(),
            hostname: None,
            name: mac.to_string(),
            ipv4: ip.map(String::from),
            manufacturer: None,
            reason: "arp-response".to_string(),
            last_update: Utc::now(),
            offline_scans: 0,
        }
    }

    #[test]
    fn test_short_hostname() {
        assert_eq!(short_hostname("phone.lan"), "phone");
        assert_eq!(short_hostname("phone"), "phone");
    }

    #[test]
    fn test_human_readable_name() {
        let mac = "b8:27:eb:12:34:56";
        assert_eq!(human_readable_name(Some("pi.local"), Some("Raspberry Pi"), mac), "pi");
        assert_eq!(human_readable_name(None, Some("Raspberry Pi"), mac), "Raspberry Pi 12:34:56");
        assert_eq!(human_readable_name(Some(""), None, mac), "Nmap Tracker b8:27:eb:12:34:56");
    }

    #[test]
    fn test_human_readable_name_unformatted_address() {
        // format_mac passes anything that is not 12 hex digits through as-is.
        assert_eq!(human_readable_name(None, Some("Acme"), "ab"), "Acme ab");
        assert_eq!(human_readable_name(None, Some("Acme"), "gerät-ä:ö:ü:ß"), "Acme -ä:ö:ü:ß");
    }

    #[test]
    fn test_claim_first_owner_wins() {
        let devices = NmapTrackedDevices::new();
        assert!(devices.claim("aa", "entry1"));
        assert!(devices.claim("aa", "entry1"));
        assert!(!devices.claim("aa", "entry2"));
    }

    #[test]
    fn test_untrack_entry_removes_only_owned() {
        let devices = NmapTrackedDevices::new();
        for (mac, ip, owner) in [("m1", "10.0.0.1", "e1"), ("m2", "10.0.0.2", "e2")] {
            devices.tracked.insert(mac.to_string(), device(mac, Some(ip)));
            devices.ipv4_last_mac.insert(ip.to_string(), mac.to_string());
            devices.config_entry_owner.insert(mac.to_string(), owner.to_string());
        }

        assert_eq!(devices.untrack_entry("e1"), vec!["m1".to_string()]);
        assert!(devices.get("m1").is_none());
        assert!(!devices.ipv4_last_mac.contains_key("10.0.0.1"));
        assert!(!devices.config_entry_owner.contains_key("m1"));
        assert!(devices.get("m2").is_some());
        assert_eq!(devices.devices_for_entry("e2").len(), 1);
    }

    #[test]
    fn test_entry_config_intervals() {
        let mut config = NmapEntryConfig::new("lan", "192.168.1.0/24,,10.0.0.1");
        assert_eq!(config.host_list().len(), 2);
        assert!(config.home_interval().is_none());
        config.home_interval = 10;
        assert_eq!(config.home_interval(), Some(chrono::Duration::minutes(10)));
        assert_eq!(config.scan_interval(), Duration::from_secs(TRACKER_SCAN_INTERVAL));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_device_new("e1"), "nmap_tracker-device-new-e1");
        assert_eq!(signal_device_missing("e1"), "nmap_tracker-device-missing-e1");
        assert_eq!(signal_device_update("aa:bb"), "nmap_tracker-device-update-aa:bb");
    }

    struct OneHost;

    impl nmap::PortScanner for OneHost {
        fn scan(&self, _hosts: &str, _arguments: &str, _timeout: Duration) -> Result<nmap::ScanReport, crate::error::ScanError> {
            let mut report = nmap::ScanReport::default();
            report.hosts.insert(
                "192.168.1.10".to_string(),
                nmap::HostScan {
                    state: "up".to_string(),
                    reason: "arp-response".to_string(),
                    mac: Some("AA:BB:CC:DD:EE:01".to_string()),
                    vendor: Some("Apple".to_string()),
                    hostnames: vec!["phone.lan".to_string()],
                },
            );
            Ok(report)
        }
    }

    /// A busy /24: `192.168.1.1` to `192.168.1.100`, all answering.
    struct ManyHosts;

    impl nmap::PortScanner for ManyHosts {
        fn scan(&self, _hosts: &str, _arguments: &str, _timeout: Duration) -> Result<nmap::ScanReport, crate::error::ScanError> {
            let mut report = nmap::ScanReport::default();
            for i in 1..=100u32 {
                report.hosts.insert(
                    format!("192.168.1.{}", i),
                    nmap::HostScan {
                        state: "up".to_string(),
                        reason: "arp-response".to_string(),
                        mac: Some(format!("AA:BB:CC:00:00:{:02X}", i)),
                        vendor: None,
                        hostnames: vec![format!("host{}.lan", i)],
                    },
                );
            }
            Ok(report)
        }
    }

    struct NoArp;

    impl mac::MacResolver for NoArp {
        fn resolve(&self, _ip: &str) -> Option<String> {
            None
        }
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn test_setup_scan_and_unload() {
        let app = Arc::new(AppState::for_tests());
        // Registered in an earlier run, never answers.
        app.entity_registry
            .register(DOMAIN, "aa:bb:cc:dd:ee:99", "device_tracker.old_laptop", "lan", Some("Old Laptop"))
            .unwrap();

        let tracker = NmapTracker::new(
            app.clone(),
            Arc::new(vendor::MacVendorLookup::new()),
            Arc::new(OneHost),
            Arc::new(NoArp),
        );
        tracker.setup_entry(&NmapEntryConfig::new("lan", "192.168.1.0/24")).unwrap();
        assert_eq!(tracker.entry_ids(), vec!["lan".to_string()]);

        let state_of = |id: &str| app.state_machine.get(id).map(|s| s.state);
        wait_for(|| state_of("device_tracker.phone").as_deref() == Some(crate::state::STATE_HOME)).await;
        wait_for(|| state_of("device_tracker.old_laptop").as_deref() == Some(crate::state::STATE_NOT_HOME)).await;
        assert_eq!(tracker.devices().devices_for_entry("lan").len(), 2);

        assert!(tracker.unload_entry("lan"));
        assert!(!tracker.unload_entry("lan"));
        assert!(tracker.devices().tracked.is_empty());
        assert!(tracker.entry_ids().is_empty());
    }

    #[tokio::test]
    async fn test_every_device_of_a_large_scan_gets_an_entity() {
        let app = Arc::new(AppState::for_tests());
        // Registered in an earlier run, none of them answer.
        for i in 1..=100u32 {
            let mac = format!("aa:bb:cc:ff:00:{:02x}", i);
            let name = format!("Gone {}", i);
            let entity_id = format!("device_tracker.gone_{}", i);
            app.entity_registry
                .register(DOMAIN, &mac, &entity_id, "lan", Some(name.as_str()))
                .unwrap();
        }

        let tracker = NmapTracker::new(
            app.clone(),
            Arc::new(vendor::MacVendorLookup::new()),
            Arc::new(ManyHosts),
            Arc::new(NoArp),
        );
        tracker.setup_entry(&NmapEntryConfig::new("lan", "192.168.1.0/24")).unwrap();

        let count = |state: &str| {
            app.state_machine
                .get_all()
                .into_iter()
                .filter(|s| s.entity_id.starts_with("device_tracker.") && s.state == state)
                .count()
        };
        wait_for(|| count(crate::state::STATE_HOME) == 100 && count(crate::state::STATE_NOT_HOME) == 100).await;
        assert_eq!(tracker.devices().devices_for_entry("lan").len(), 200);
        assert_eq!(
            app.state_machine.get("device_tracker.host42").map(|s| s.state).as_deref(),
            Some(crate::state::STATE_HOME)
        );
        assert!(tracker.unload_entry("lan"));
    }

    #[test]
    fn test_setup_rejects_invalid_entry() {
        let app = Arc::new(AppState::for_tests());
        let tracker = NmapTracker::new(
            app,
            Arc::new(vendor::MacVendorLookup::new()),
            Arc::new(OneHost),
            Arc::new(NoArp),
        );
        let mut config = NmapEntryConfig::new("lan", "192.168.1.0/24");
        config.scan_interval = 0;
        assert!(matches!(
            tracker.setup_entry(&config),
            Err(ConfigError::Invalid { field: "scan_interval", .. })
        ));
    }
}


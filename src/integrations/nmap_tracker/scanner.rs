//! Per-registration scan loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::mac::{format_mac, MacResolver};
use super::nmap::{PortScanner, ScanReport};
use super::vendor::MacVendorLookup;
use super::{
    human_readable_name, signal_device_missing, signal_device_new, signal_device_update,
    NmapDevice, NmapEntryConfig, NmapTrackedDevices, MAX_SCAN_ATTEMPTS,
    NMAP_TRANSIENT_FAILURE, OFFLINE_SCANS_TO_MARK_UNAVAILABLE,
};
use crate::dispatcher::{DispatchPayload, Dispatcher};
use crate::error::ScanError;

const NO_MAC_FOUND: &str = "No MAC address found";
const NOT_FOUND_IN_INITIAL_SCAN: &str = "Device not found in initial scan";

pub struct NmapDeviceScanner {
    entry_id: String,
    hosts: Vec<String>,
    exclude: Vec<String>,
    options: String,
    home_interval: Option<chrono::Duration>,
    scan_interval: Duration,
    track_new_devices: bool,
    /// mac -> original name, from the entity registry at setup.
    known_mac_addresses: HashMap<String, Option<String>>,

    devices: Arc<NmapTrackedDevices>,
    dispatcher: Arc<Dispatcher>,
    port_scanner: Arc<dyn PortScanner>,
    mac_resolver: Arc<dyn MacResolver>,
    vendors: Arc<MacVendorLookup>,

    scan_lock: tokio::sync::Mutex<()>,
    last_results: std::sync::Mutex<Vec<NmapDevice>>,
    finished_first_scan: AtomicBool,
    stopping: AtomicBool,
}

impl NmapDeviceScanner {
    pub fn new(
        config: &NmapEntryConfig,
        devices: Arc<NmapTrackedDevices>,
        dispatcher: Arc<Dispatcher>,
        port_scanner: Arc<dyn PortScanner>,
        mac_resolver: Arc<dyn MacResolver>,
        vendors: Arc<MacVendorLookup>,
        known_mac_addresses: HashMap<String, Option<String>>,
    ) -> Self {
        Self {
            entry_id: config.entry_id.clone(),
            hosts: config.host_list(),
            exclude: config.exclude_list(),
            options: config.options.clone(),
            home_interval: config.home_interval(),
            scan_interval: config.scan_interval(),
            track_new_devices: config.track_new_devices,
            known_mac_addresses,
            devices,
            dispatcher,
            port_scanner,
            mac_resolver,
            vendors,
            scan_lock: tokio::sync::Mutex::new(()),
            last_results: std::sync::Mutex::new(Vec::new()),
            finished_first_scan: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Build the nmap argument string and drop previous results that fell
    /// out of the home window.
    pub fn build_options(&self, now: DateTime<Utc>) -> String {
        let mut options = self.options.clone();
        let mut last_results = self.last_results.lock().unwrap_or_else(|e| e.into_inner());

        match self.home_interval {
            Some(window) => {
                let boundary = now - window;
                last_results.retain(|device| device.last_update > boundary);
            }
            None => last_results.clear(),
        }

        let mut exclude_hosts = self.exclude.clone();
        exclude_hosts.extend(last_results.iter().filter_map(|d| d.ipv4.clone()));
        if !exclude_hosts.is_empty() {
            options.push_str(&format!(" --exclude {}", exclude_hosts.join(",")));
        }
        if !options.contains("--reason") {
            options.push_str(" --reason");
        }
        if !options.contains("-v") {
            options.push_str(" -v");
        }
        options
    }

    /// One tick. Skipped when the previous tick still holds the lock.
    pub async fn scan_devices(&self) {
        let Ok(_guard) = self.scan_lock.try_lock() else {
            tracing::debug!(
                entry_id = %self.entry_id,
                "Nmap scanning is taking longer than the scheduled interval: {}s",
                self.scan_interval.as_secs()
            );
            return;
        };

        if let Err(e) = self.run_nmap_scan().await {
            tracing::error!(entry_id = %self.entry_id, "Nmap scanning failed: {}", e);
        }

        if !self.is_stopping() && !self.finished_first_scan.swap(true, Ordering::SeqCst) {
            self.mark_missing_devices_as_not_home();
        }
    }

    async fn run_nmap_scan(&self) -> Result<(), ScanError> {
        let options = self.build_options(Utc::now());
        let hosts = self.hosts.join(" ");
        let timeout = self.scan_interval * 10;
        tracing::debug!(entry_id = %self.entry_id, "Scanning {} with args: {}", hosts, options);

        let scanner = self.port_scanner.clone();
        let report = tokio::task::spawn_blocking(move || {
            scan_with_retries(scanner.as_ref(), &hosts, &options, timeout)
        })
        .await
        .map_err(|e| ScanError::Worker(e.to_string()))??;

        if self.is_stopping() {
            tracing::debug!(entry_id = %self.entry_id, "Discarding scan result after stop");
            return Ok(());
        }

        tracing::debug!(entry_id = %self.entry_id, hosts = report.hosts.len(), "Finished scanning");
        self.process_scan_result(report).await;
        Ok(())
    }

    async fn process_scan_result(&self, report: ScanReport) {
        let now = Utc::now();

        for (ipv4, host) in report.hosts {
            if host.state != "up" {
                self.increment_device_offline(&ipv4, &host.reason);
                continue;
            }

            // nmap only reports the MAC when it runs privileged.
            let mac = match host.mac.clone() {
                Some(mac) => Some(mac),
                None => self.resolve_mac(&ipv4).await,
            };
            let Some(mac) = mac else {
                self.increment_device_offline(&ipv4, NO_MAC_FOUND);
                tracing::info!("No MAC address found for {}", ipv4);
                continue;
            };

            let formatted_mac = format_mac(&mac);
            let new = !self.devices.tracked.contains_key(&formatted_mac);
            if new
                && !self.track_new_devices
                && !self.known_mac_addresses.contains_key(&formatted_mac)
            {
                continue;
            }

            if !self.devices.claim(&formatted_mac, &self.entry_id) {
                continue;
            }

            let hostname = host.hostnames.first().cloned();
            let vendor = host.vendor.clone().or_else(|| self.vendors.get(&formatted_mac));
            let name = human_readable_name(hostname.as_deref(), vendor.as_deref(), &formatted_mac);
            let device = NmapDevice {
                mac_address: formatted_mac.clone(),
                hostname,
                name,
                ipv4: Some(ipv4.clone()),
                manufacturer: vendor,
                reason: host.reason.clone(),
                last_update: now,
                offline_scans: 0,
            };

            self.devices.tracked.insert(formatted_mac.clone(), device.clone());
            self.devices.ipv4_last_mac.insert(ipv4, formatted_mac.clone());
            self.last_results
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(device);

            if new {
                self.dispatcher.send(
                    &signal_device_new(&self.entry_id),
                    DispatchPayload::Mac(formatted_mac),
                );
            } else {
                self.dispatcher.send(
                    &signal_device_update(&formatted_mac),
                    DispatchPayload::Available(true),
                );
            }
        }
    }

    async fn resolve_mac(&self, ipv4: &str) -> Option<String> {
        let resolver = self.mac_resolver.clone();
        let ip = ipv4.to_string();
        tokio::task::spawn_blocking(move || resolver.resolve(&ip))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("MAC lookup for {} failed: {}", ipv4, e);
                None
            })
    }

    fn increment_device_offline(&self, ipv4: &str, reason: &str) {
        let Some(formatted_mac) = self.devices.ipv4_last_mac.get(ipv4).map(|m| m.value().clone()) else {
            return;
        };
        {
            // Device may have been unloaded.
            let Some(mut device) = self.devices.tracked.get_mut(&formatted_mac) else {
                return;
            };
            device.offline_scans += 1;
            if device.offline_scans < OFFLINE_SCANS_TO_MARK_UNAVAILABLE {
                return;
            }
            device.reason = reason.to_string();
        }

        tracing::debug!(mac = %formatted_mac, ipv4, reason, "Device went offline");
        self.dispatcher.send(
            &signal_device_update(&formatted_mac),
            DispatchPayload::Available(false),
        );
        self.devices.ipv4_last_mac.remove(ipv4);
    }

    /// After the first tick, known devices nobody has seen are reported as
    /// not home instead of staying unavailable.
    fn mark_missing_devices_as_not_home(&self) {
        let now = Utc::now();
        for (mac_address, original_name) in &self.known_mac_addresses {
            if self.devices.tracked.contains_key(mac_address) {
                continue;
            }
            let vendor = self.vendors.get(mac_address);
            let name = original_name
                .clone()
                .unwrap_or_else(|| human_readable_name(None, vendor.as_deref(), mac_address));

            self.devices
                .config_entry_owner
                .insert(mac_address.clone(), self.entry_id.clone());
            self.devices.tracked.insert(
                mac_address.clone(),
                NmapDevice {
                    mac_address: mac_address.clone(),
                    hostname: None,
                    name,
                    ipv4: None,
                    manufacturer: vendor,
                    reason: NOT_FOUND_IN_INITIAL_SCAN.to_string(),
                    last_update: now,
                    offline_scans: 1,
                },
            );
            self.dispatcher.send(
                &signal_device_missing(&self.entry_id),
                DispatchPayload::Mac(mac_address.clone()),
            );
        }
    }
}

/// Run a scan, retrying while nmap hits its known timer assertion.
pub fn scan_with_retries(
    scanner: &dyn PortScanner,
    hosts: &str,
    options: &str,
    timeout: Duration,
) -> Result<ScanReport, ScanError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match scanner.scan(hosts, options, timeout) {
            Ok(report) => return Ok(report),
            Err(e) if attempt < MAX_SCAN_ATTEMPTS && e.to_string().contains(NMAP_TRANSIENT_FAILURE) => {
                tracing::debug!(attempt, "Nmap saw transient error {}", NMAP_TRANSIENT_FAILURE);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Spawn the scan interval for `scanner`. The first tick fires immediately;
/// each tick runs in its own task so a slow scan makes the next one skip.
pub fn start_scan_interval(scanner: Arc<NmapDeviceScanner>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(scanner.scan_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if scanner.is_stopping() {
                break;
            }
            let tick = scanner.clone();
            tokio::spawn(async move { tick.scan_devices().await });
        }
    })
}

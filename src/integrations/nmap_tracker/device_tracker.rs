//! `device_tracker` entities for nmap-tracked devices.
//!
//! One entity per hardware address. Entities are created on the
//! registration's "new" and "missing" signals and then follow the device's
//! update signal until the registration is unloaded.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

use super::{
    signal_device_missing, signal_device_new, signal_device_update, NmapDevice,
    NmapTrackedDevices, DOMAIN, OFFLINE_SCANS_TO_MARK_UNAVAILABLE,
};
use crate::api::AppState;
use crate::dispatcher::DispatchPayload;
use crate::state::{slugify, Attributes, STATE_HOME, STATE_NOT_HOME};

pub const SOURCE_TYPE_ROUTER: &str = "router";

/// Connect to the registration's signals and spawn the task that adds
/// entities. Signals are connected before returning so the first scan
/// cannot race the platform.
pub fn start_platform(
    app: Arc<AppState>,
    devices: Arc<NmapTrackedDevices>,
    entry_id: &str,
) -> tokio::task::JoinHandle<()> {
    let entry_id = entry_id.to_string();
    let mut new_rx = app.dispatcher.connect(&signal_device_new(&entry_id));
    let mut missing_rx = app.dispatcher.connect(&signal_device_missing(&entry_id));

    tokio::spawn(async move {
        let mut added = HashSet::new();
        let mut new_open = true;
        let mut missing_open = true;

        while new_open || missing_open {
            let next = tokio::select! {
                msg = new_rx.recv(), if new_open => next_mac(msg, true),
                msg = missing_rx.recv(), if missing_open => next_mac(msg, false),
            };

            match next {
                Next::Mac(mac, active) => {
                    add_entity(&app, &devices, &entry_id, &mut added, &mac, active);
                }
                // Signals were dropped; the device table still has every
                // device this registration announced.
                Next::Resync => {
                    for device in devices.devices_for_entry(&entry_id) {
                        let active = device.ipv4.is_some()
                            && device.offline_scans < OFFLINE_SCANS_TO_MARK_UNAVAILABLE;
                        add_entity(&app, &devices, &entry_id, &mut added, &device.mac_address, active);
                    }
                }
                Next::Skip => {}
                Next::Closed(true) => new_open = false,
                Next::Closed(false) => missing_open = false,
            }
        }
        tracing::debug!(entry_id = %entry_id, "device_tracker platform stopped");
    })
}

fn add_entity(
    app: &Arc<AppState>,
    devices: &Arc<NmapTrackedDevices>,
    entry_id: &str,
    added: &mut HashSet<String>,
    mac: &str,
    active: bool,
) {
    if !added.insert(mac.to_string()) {
        return;
    }
    if let Some(entity) = NmapTrackerEntity::add(app, devices, entry_id, mac, active) {
        tokio::spawn(entity.run());
    }
}

enum Next {
    /// Address and whether it came from the "new" signal.
    Mac(String, bool),
    Resync,
    Skip,
    Closed(bool),
}

fn next_mac(msg: Result<DispatchPayload, RecvError>, from_new: bool) -> Next {
    match msg {
        Ok(DispatchPayload::Mac(mac)) => Next::Mac(mac, from_new),
        Ok(other) => {
            tracing::warn!("Unexpected payload on device signal: {:?}", other);
            Next::Skip
        }
        Err(RecvError::Lagged(n)) => {
            tracing::warn!("device_tracker platform lagged by {} signals, resyncing", n);
            Next::Resync
        }
        Err(RecvError::Closed) => Next::Closed(from_new),
    }
}

pub struct NmapTrackerEntity {
    app: Arc<AppState>,
    devices: Arc<NmapTrackedDevices>,
    entity_id: String,
    mac_address: String,
    active: bool,
    updates: Receiver<DispatchPayload>,
}

impl NmapTrackerEntity {
    /// Register the entity and write its first state. `None` when the device
    /// is no longer tracked.
    fn add(
        app: &Arc<AppState>,
        devices: &Arc<NmapTrackedDevices>,
        entry_id: &str,
        mac: &str,
        active: bool,
    ) -> Option<Self> {
        let device = devices.get(mac)?;
        let suggested = format!("device_tracker.{}", slugify(&device.name));

        let entity_id = match app.entity_registry.register(
            DOMAIN,
            mac,
            &suggested,
            entry_id,
            Some(&device.name),
        ) {
            Ok(entry) => entry.entity_id,
            Err(e) => {
                tracing::warn!(mac, "Failed to register entity: {}", e);
                suggested
            }
        };

        let entity = Self {
            app: app.clone(),
            devices: devices.clone(),
            entity_id,
            mac_address: mac.to_string(),
            active,
            updates: app.dispatcher.connect(&signal_device_update(mac)),
        };
        tracing::info!(entity_id = %entity.entity_id, mac, "Added nmap device tracker");
        entity.write_state(&device);
        Some(entity)
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Follow the update signal until it is disconnected.
    pub async fn run(mut self) {
        loop {
            match self.updates.recv().await {
                Ok(DispatchPayload::Available(online)) => self.on_update(online),
                Ok(other) => tracing::warn!("Unexpected payload on update signal: {:?}", other),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!(entity_id = %self.entity_id, "Entity removed");
    }

    fn on_update(&mut self, online: bool) {
        self.active = online;
        // Device was unloaded.
        let Some(device) = self.devices.get(&self.mac_address) else {
            return;
        };
        self.write_state(&device);
    }

    fn write_state(&self, device: &NmapDevice) {
        let state = if self.active { STATE_HOME } else { STATE_NOT_HOME };
        self.app.state_machine.set(
            self.entity_id.clone(),
            state.to_string(),
            device_attributes(device),
        );
    }
}

fn device_attributes(device: &NmapDevice) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("friendly_name".into(), serde_json::json!(device.name));
    attrs.insert("source_type".into(), serde_json::json!(SOURCE_TYPE_ROUTER));
    attrs.insert("ip".into(), serde_json::json!(device.ipv4));
    attrs.insert("mac".into(), serde_json::json!(device.mac_address));
    attrs.insert("host_name".into(), serde_json::json!(device.hostname));
    attrs.insert("vendor".into(), serde_json::json!(device.manufacturer));
    attrs.insert("reason".into(), serde_json::json!(device.reason));
    attrs.insert(
        "last_time_reachable".into(),
        serde_json::json!(device.last_update.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
    );
    attrs
}

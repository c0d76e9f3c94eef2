mod api;
mod automation;
mod config;
mod dispatcher;
mod entity_registry;
mod error;
mod integrations;
mod services;
mod state;
mod template;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use api::AppState;
use automation::AutomationEngine;
use config::HearthConfig;
use entity_registry::EntityRegistry;
use integrations::nmap_tracker::mac::ArpResolver;
use integrations::nmap_tracker::nmap::NmapProcess;
use integrations::nmap_tracker::vendor::{MacVendorLookup, OUI_URL};
use integrations::nmap_tracker::NmapTracker;
use integrations::zwave::device_condition::ZwaveDeviceConditions;
use integrations::zwave::ZwaveNetwork;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hearth=debug")),
        )
        .init();

    tracing::info!("Starting Hearth v{}", env!("CARGO_PKG_VERSION"));

    let config_path = PathBuf::from(
        std::env::var("HEARTH_CONFIG").unwrap_or_else(|_| "hearth.yaml".to_string()),
    );
    let config = HearthConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let registry = EntityRegistry::open(&config.db_path)
        .with_context(|| format!("opening entity registry {}", config.db_path.display()))?;
    let app_state = Arc::new(AppState::new(registry));

    // ── nmap_tracker ─────────────────────────────────────
    // Owns the registrations for the lifetime of the process.
    let _nmap_tracker = if config.nmap_tracker.is_empty() {
        None
    } else {
        let vendors = Arc::new(MacVendorLookup::new());
        let client = reqwest::Client::new();
        match vendors.load_vendors(&client, OUI_URL).await {
            Ok(count) => tracing::info!("Loaded {} MAC vendor prefixes", count),
            Err(e) => tracing::debug!("MAC vendor table unavailable: {}", e),
        }

        let tracker = NmapTracker::new(
            app_state.clone(),
            vendors,
            Arc::new(NmapProcess::new()),
            Arc::new(ArpResolver),
        );
        for entry in &config.nmap_tracker {
            if let Err(e) = tracker.setup_entry(entry) {
                tracing::error!(entry_id = %entry.entry_id, "nmap_tracker setup failed: {}", e);
            }
        }
        Some(tracker)
    };

    // ── Ombi ─────────────────────────────────────────────
    if let Some(ombi) = config.ombi.clone() {
        if let Err(e) = integrations::ombi::start_ombi_poller(app_state.clone(), ombi) {
            tracing::error!("Ombi setup failed: {}", e);
        }
    }

    // ── Automations ──────────────────────────────────────
    let automations = if config.automations.exists() {
        automation::load_automations(&config.automations)
            .with_context(|| format!("loading {}", config.automations.display()))?
    } else {
        Vec::new()
    };
    let mut engine = AutomationEngine::new(automations, app_state.clone(), app_state.services.clone());

    // ── Z-Wave ───────────────────────────────────────────
    if let Some(zwave) = &config.zwave {
        let network = Arc::new(ZwaveNetwork::new(app_state.clone()));
        match network.load(&zwave.nodes_file) {
            Ok(_) => engine.register_device_conditions(
                integrations::zwave::DOMAIN,
                Arc::new(ZwaveDeviceConditions::new(network)),
            ),
            Err(e) => tracing::error!("Z-Wave nodes not loaded: {}", e),
        }
    }

    let invalid = engine.validate_device_conditions();
    if invalid > 0 {
        tracing::warn!("{} device condition(s) will never pass", invalid);
    }
    tokio::spawn(Arc::new(engine).run());

    // ── HTTP ─────────────────────────────────────────────
    let app = api::router(app_state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

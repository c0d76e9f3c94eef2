//! Service registry.
//!
//! Maps `(domain, service)` to a handler. Automation actions and the REST API
//! dispatch through the same registry.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::state::{slugify, Attributes, EntityState, StateMachine};

/// The data passed to a service handler when a service is called.
#[derive(Debug, Clone)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub entity_id: String,
    pub data: Value,
}

/// Handles a service call. Returns the new state of `call.entity_id`, or
/// `None` when the call does not change it.
pub type ServiceHandlerFn =
    Box<dyn Fn(&ServiceCall, &StateMachine) -> Option<ServiceResult> + Send + Sync>;

pub struct ServiceResult {
    pub state: String,
    pub attributes: Attributes,
}

pub struct ServiceRegistry {
    handlers: HashMap<(String, String), ServiceHandlerFn>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register_builtins();
        registry
    }

    /// Call a service once per target entity. Calls without targets run
    /// once with an empty entity id. Returns the states that changed.
    pub fn call(
        &self,
        domain: &str,
        service: &str,
        entity_ids: &[String],
        data: &Value,
        state_machine: &StateMachine,
    ) -> Vec<EntityState> {
        let Some(handler) = self.handlers.get(&(domain.to_string(), service.to_string())) else {
            tracing::warn!("No handler for {}.{}", domain, service);
            return Vec::new();
        };

        let untargeted = [String::new()];
        let targets = if entity_ids.is_empty() { &untargeted[..] } else { entity_ids };

        let mut changed = Vec::new();
        for eid in targets {
            let call = ServiceCall {
                domain: domain.to_string(),
                service: service.to_string(),
                entity_id: eid.clone(),
                data: data.clone(),
            };
            if let Some(sr) = handler(&call, state_machine) {
                if call.entity_id.is_empty() {
                    continue;
                }
                changed.push(state_machine.set(call.entity_id, sr.state, sr.attributes));
            }
        }
        changed
    }

    fn register_builtins(&mut self) {
        // ── Persistent notification ──────────────────────
        self.register("persistent_notification", "create", |call, sm| {
            let title = call.data.get("title").and_then(Value::as_str).unwrap_or("");
            let message = call.data.get("message").and_then(Value::as_str).unwrap_or("");
            let id = call
                .data
                .get("notification_id")
                .and_then(Value::as_str)
                .map(slugify)
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
            tracing::info!("NOTIFICATION: {} - {}", title, message);

            let mut attrs = Attributes::new();
            attrs.insert("title".into(), serde_json::json!(title));
            attrs.insert("message".into(), serde_json::json!(message));
            sm.set(format!("persistent_notification.{}", id), "notifying".to_string(), attrs);
            None
        });
    }

    /// Register a service handler for (domain, service), replacing any
    /// previous one.
    pub fn register<F>(&mut self, domain: &str, service: &str, handler: F)
    where
        F: Fn(&ServiceCall, &StateMachine) -> Option<ServiceResult> + Send + Sync + 'static,
    {
        self.handlers
            .insert((domain.to_string(), service.to_string()), Box::new(handler));
    }

    pub fn has_handler(&self, domain: &str, service: &str) -> bool {
        self.handlers.contains_key(&(domain.to_string(), service.to_string()))
    }

    /// All registered services grouped by domain.
    pub fn list_services(&self) -> BTreeMap<String, Vec<String>> {
        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (domain, service) in self.handlers.keys() {
            result.entry(domain.clone()).or_default().push(service.clone());
        }
        for services in result.values_mut() {
            services.sort();
        }
        result
    }
}

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::api::AppState;
use crate::error::ConditionError;
use crate::services::ServiceRegistry;
use crate::state::{Event, StateChangedEvent};
use crate::template;

/// A compiled device condition. Reads live device state on every call.
pub type ConditionChecker = Box<dyn Fn() -> bool + Send + Sync>;

/// Device conditions offered by one integration domain.
pub trait DeviceConditionPlatform: Send + Sync {
    /// Every condition the device supports, as ready-to-use configs.
    fn get_conditions(&self, device_id: &str) -> Result<Vec<Map<String, Value>>, ConditionError>;

    /// Extra fields a condition config needs. Empty when there are none or
    /// the config is not understood.
    fn condition_capabilities(&self, config: &Map<String, Value>) -> Map<String, Value>;

    fn condition_from_config(&self, config: &Map<String, Value>) -> Result<ConditionChecker, ConditionError>;
}

// ── YAML Deserialization Structs ─────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Automation {
    pub id: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "trigger")]
pub enum Trigger {
    #[serde(rename = "state")]
    State {
        entity_id: StringOrVec,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        from: Option<String>,
    },
    #[serde(rename = "event")]
    Event {
        event_type: String,
        #[serde(default)]
        event_data: Option<Map<String, Value>>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "condition")]
pub enum Condition {
    #[serde(rename = "state")]
    State {
        entity_id: String,
        state: String,
    },
    #[serde(rename = "or")]
    Or {
        conditions: Vec<Condition>,
    },
    #[serde(rename = "and")]
    And {
        conditions: Vec<Condition>,
    },
    #[serde(rename = "template")]
    Template {
        value_template: String,
    },
    #[serde(rename = "numeric_state")]
    NumericState {
        entity_id: String,
        #[serde(default)]
        above: Option<f64>,
        #[serde(default)]
        below: Option<f64>,
    },
    /// Handed to the [`DeviceConditionPlatform`] registered for `domain`.
    #[serde(rename = "device")]
    Device(Map<String, Value>),
}

/// A service call, e.g. `action: persistent_notification.create`.
#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    pub action: String,
    #[serde(default)]
    pub target: Option<ActionTarget>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionTarget {
    #[serde(default)]
    pub entity_id: Option<StringOrVec>,
}

/// Handles YAML values that can be a single string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrVec {
    Single(String),
    Multiple(Vec<String>),
}

impl StringOrVec {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringOrVec::Single(s) => vec![s.clone()],
            StringOrVec::Multiple(v) => v.clone(),
        }
    }

    fn contains(&self, value: &str) -> bool {
        match self {
            StringOrVec::Single(s) => s == value,
            StringOrVec::Multiple(v) => v.iter().any(|s| s == value),
        }
    }
}

// ── Parser ───────────────────────────────────────────────

pub fn load_automations(path: &Path) -> anyhow::Result<Vec<Automation>> {
    let contents = std::fs::read_to_string(path)?;
    let automations: Vec<Automation> = serde_yaml::from_str(&contents)?;
    Ok(automations)
}

// ── Engine ───────────────────────────────────────────────

pub struct AutomationEngine {
    automations: Vec<Automation>,
    app: Arc<AppState>,
    services: Arc<RwLock<ServiceRegistry>>,
    device_conditions: HashMap<String, Arc<dyn DeviceConditionPlatform>>,
}

impl AutomationEngine {
    pub fn new(
        automations: Vec<Automation>,
        app: Arc<AppState>,
        services: Arc<RwLock<ServiceRegistry>>,
    ) -> Self {
        tracing::info!("Loaded {} automations", automations.len());
        for auto in &automations {
            tracing::info!(
                "  [{}] {}: {} trigger(s), {} condition(s), {} action(s)",
                auto.id,
                auto.alias,
                auto.triggers.len(),
                auto.conditions.len(),
                auto.actions.len()
            );
        }

        Self {
            automations,
            app,
            services,
            device_conditions: HashMap::new(),
        }
    }

    pub fn register_device_conditions(&mut self, domain: &str, platform: Arc<dyn DeviceConditionPlatform>) {
        tracing::debug!("Device conditions registered for {}", domain);
        self.device_conditions.insert(domain.to_string(), platform);
    }

    pub fn automation_ids(&self) -> Vec<String> {
        self.automations.iter().map(|a| a.id.clone()).collect()
    }

    /// Compile every device condition once and log the ones that would
    /// never pass. Returns how many are invalid.
    pub fn validate_device_conditions(&self) -> usize {
        fn collect<'a>(conditions: &'a [Condition], out: &mut Vec<&'a Map<String, Value>>) {
            for condition in conditions {
                match condition {
                    Condition::Device(config) => out.push(config),
                    Condition::And { conditions } | Condition::Or { conditions } => collect(conditions, out),
                    _ => {}
                }
            }
        }

        let mut invalid = 0;
        for auto in &self.automations {
            let mut configs = Vec::new();
            collect(&auto.conditions, &mut configs);
            for config in configs {
                if let Err(e) = self.compile_device_condition(config) {
                    tracing::warn!("Automation [{}] has an invalid device condition: {}", auto.id, e);
                    invalid += 1;
                }
            }
        }
        invalid
    }

    /// Listen for state changes and fired events until a source closes.
    pub async fn run(self: Arc<Self>) {
        let mut states = self.app.state_machine.subscribe();
        let mut events = self.app.event_bus.subscribe();

        loop {
            tokio::select! {
                msg = states.recv() => match msg {
                    Ok(event) => { self.on_state_changed(&event); }
                    Err(RecvError::Lagged(n)) => tracing::warn!("Automation engine lagged by {} state changes", n),
                    Err(RecvError::Closed) => break,
                },
                msg = events.recv() => match msg {
                    Ok(event) => { self.on_event(&event); }
                    Err(RecvError::Lagged(n)) => tracing::warn!("Automation engine lagged by {} events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    // ── Trigger Handlers ──────────────────────────────────

    /// Evaluate a state_changed event against all automations.
    /// Returns the IDs of automations that fired.
    pub fn on_state_changed(&self, event: &StateChangedEvent) -> Vec<String> {
        let mut fired = Vec::new();

        for auto in &self.automations {
            if !self.state_triggers_match(auto, event) {
                continue;
            }
            let vars = json!({
                "trigger": {
                    "platform": "state",
                    "entity_id": event.entity_id,
                    "from_state": event.old_state,
                    "to_state": event.new_state,
                }
            });
            if self.conditions_met(auto, &vars) {
                tracing::info!("Automation [{}] triggered by {}", auto.id, event.entity_id);
                self.execute_actions(auto, &vars);
                fired.push(auto.id.clone());
            }
        }

        fired
    }

    /// Fire an event and check if any automation triggers on it.
    pub fn on_event(&self, event: &Event) -> Vec<String> {
        let mut fired = Vec::new();

        for auto in &self.automations {
            let matches = auto.triggers.iter().any(|t| match t {
                Trigger::Event { event_type, event_data } => {
                    *event_type == event.event_type && event_data_matches(event_data.as_ref(), &event.data)
                }
                _ => false,
            });
            if !matches {
                continue;
            }

            let vars = json!({
                "trigger": {
                    "platform": "event",
                    "event": {
                        "event_type": event.event_type,
                        "data": event.data,
                    }
                }
            });
            if self.conditions_met(auto, &vars) {
                tracing::info!("Automation [{}] triggered by event {}", auto.id, event.event_type);
                self.execute_actions(auto, &vars);
                fired.push(auto.id.clone());
            }
        }

        fired
    }

    // ── Trigger Matching ──────────────────────────────────

    fn state_triggers_match(&self, auto: &Automation, event: &StateChangedEvent) -> bool {
        auto.triggers.iter().any(|trigger| match trigger {
            Trigger::State { entity_id, to, from } => {
                if !entity_id.contains(&event.entity_id) {
                    return false;
                }
                if let Some(to_val) = to {
                    if event.new_state.state != *to_val {
                        return false;
                    }
                }
                if let Some(from_val) = from {
                    match &event.old_state {
                        Some(old) if old.state == *from_val => {}
                        _ => return false,
                    }
                }
                true
            }
            Trigger::Event { .. } => false,
        })
    }

    // ── Condition Evaluation ──────────────────────────────

    fn conditions_met(&self, auto: &Automation, vars: &Value) -> bool {
        // Implicit AND
        auto.conditions
            .iter()
            .all(|cond| self.evaluate_condition(cond, vars))
    }

    fn evaluate_condition(&self, condition: &Condition, vars: &Value) -> bool {
        let sm = &self.app.state_machine;
        match condition {
            Condition::State { entity_id, state } => {
                sm.get(entity_id).is_some_and(|current| current.state == *state)
            }
            Condition::Or { conditions } => conditions.iter().any(|c| self.evaluate_condition(c, vars)),
            Condition::And { conditions } => conditions.iter().all(|c| self.evaluate_condition(c, vars)),
            Condition::Template { value_template } => {
                match template::render_with_state_machine(value_template, vars, sm) {
                    Ok(result) => {
                        let t = result.trim();
                        t == "true" || t == "True" || t == "1"
                    }
                    Err(e) => {
                        tracing::warn!("Template condition error: {}", e);
                        false
                    }
                }
            }
            Condition::NumericState { entity_id, above, below } => {
                let Some(val) = sm.get(entity_id).and_then(|s| s.state.parse::<f64>().ok()) else {
                    return false;
                };
                above.map_or(true, |a| val > a) && below.map_or(true, |b| val < b)
            }
            Condition::Device(config) => match self.compile_device_condition(config) {
                Ok(check) => check(),
                Err(e) => {
                    tracing::warn!("Device condition error: {}", e);
                    false
                }
            },
        }
    }

    fn compile_device_condition(&self, config: &Map<String, Value>) -> Result<ConditionChecker, ConditionError> {
        let domain = config.get("domain").and_then(Value::as_str).unwrap_or_default();
        let platform = self
            .device_conditions
            .get(domain)
            .ok_or_else(|| ConditionError::UnknownDomain(domain.to_string()))?;
        platform.condition_from_config(config)
    }

    // ── Action Execution ──────────────────────────────────

    fn execute_actions(&self, auto: &Automation, vars: &Value) {
        for action in &auto.actions {
            self.execute_service_call(action, vars);
        }
    }

    fn execute_service_call(&self, action: &Action, vars: &Value) {
        let Some((domain, service)) = action.action.split_once('.') else {
            tracing::warn!("Invalid action format: {}", action.action);
            return;
        };

        let entity_ids = action
            .target
            .as_ref()
            .and_then(|t| t.entity_id.as_ref())
            .map(|e| e.to_vec())
            .unwrap_or_default();

        let data = match &action.data {
            Some(data) => template::render_data(data, vars, &self.app.state_machine),
            None => Value::Object(Map::new()),
        };

        let registry = self.services.read().unwrap_or_else(|e| e.into_inner());
        registry.call(domain, service, &entity_ids, &data, &self.app.state_machine);
    }
}

/// Every key in the trigger's `event_data` must be present and equal.
fn event_data_matches(expected: Option<&Map<String, Value>>, data: &Value) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    expected.iter().all(|(k, v)| data.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::integrations::zwave::device_condition::ZwaveDeviceConditions;
    use crate::integrations::zwave::fixtures::{lock_schlage_be469, LOCK_DEVICE_ID};
    use crate::integrations::zwave::{NodeEvent, ZwaveNetwork, DOMAIN};
    use crate::services::ServiceResult;
    use crate::state::{Attributes, EventBus};

    type Calls = Arc<Mutex<Vec<Value>>>;

    fn engine_with(yaml: &str, app: Arc<AppState>) -> (AutomationEngine, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ServiceRegistry::new();
        let recorded = calls.clone();
        registry.register("test", "automation", move |call, _sm| -> Option<ServiceResult> {
            recorded.lock().unwrap().push(call.data.clone());
            None
        });
        let automations: Vec<Automation> = serde_yaml::from_str(yaml).unwrap();
        let engine = AutomationEngine::new(automations, app, Arc::new(RwLock::new(registry)));
        (engine, calls)
    }

    fn fire(engine: &AutomationEngine, event_type: &str) -> Vec<String> {
        engine.on_event(&Event {
            event_type: event_type.to_string(),
            data: json!({}),
            time_fired: chrono::Utc::now(),
        })
    }

    fn node_event(network: &ZwaveNetwork, event: &str) {
        let event: NodeEvent = serde_json::from_value(json!({
            "event": event,
            "nodeId": 20,
            "source": "node"
        }))
        .unwrap();
        assert!(network.receive_event(&event));
    }

    #[test]
    fn test_automations_parse() {
        let yaml = r#"
- id: phone_home
  alias: Phone arrives
  triggers:
    - trigger: state
      entity_id: [device_tracker.phone, device_tracker.tablet]
      to: home
  conditions:
    - condition: numeric_state
      entity_id: sensor.ombi_pending_requests
      above: 0
    - condition: device
      domain: zwave_js
      type: node_status
      device_id: lock_schlage_be469
      status: alive
  actions:
    - action: persistent_notification.create
      data:
        message: "{{ trigger.entity_id }} is home"
"#;
        let automations: Vec<Automation> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(automations.len(), 1);
        assert_eq!(automations[0].conditions.len(), 2);
        match &automations[0].conditions[1] {
            Condition::Device(config) => {
                assert_eq!(config["domain"], "zwave_js");
                assert_eq!(config["status"], "alive");
            }
            other => panic!("expected device condition, got {:?}", other),
        }
        match &automations[0].triggers[0] {
            Trigger::State { entity_id, .. } => assert_eq!(entity_id.to_vec().len(), 2),
            other => panic!("expected state trigger, got {:?}", other),
        }
    }

    #[test]
    fn test_state_trigger_renders_data() {
        let app = Arc::new(AppState::for_tests());
        let (engine, calls) = engine_with(
            r#"
- id: arrive
  triggers:
    - trigger: state
      entity_id: device_tracker.phone
      from: not_home
      to: home
  actions:
    - action: test.automation
      data:
        some: "{{ trigger.platform }} - {{ trigger.entity_id }} - {{ trigger.to_state.state }}"
"#,
            app.clone(),
        );

        let first = app.state_machine.set("device_tracker.phone".into(), "home".into(), Attributes::new());
        let event = StateChangedEvent {
            entity_id: "device_tracker.phone".into(),
            old_state: None,
            new_state: first.clone(),
        };
        // No old state, so `from` cannot match.
        assert!(engine.on_state_changed(&event).is_empty());

        let mut old = first.clone();
        old.state = "not_home".into();
        let event = StateChangedEvent {
            entity_id: "device_tracker.phone".into(),
            old_state: Some(old),
            new_state: first,
        };
        assert_eq!(engine.on_state_changed(&event), vec!["arrive"]);
        assert_eq!(
            calls.lock().unwrap()[0],
            json!({"some": "state - device_tracker.phone - home"})
        );
    }

    #[test]
    fn test_numeric_and_or_conditions() {
        let app = Arc::new(AppState::for_tests());
        let (engine, calls) = engine_with(
            r#"
- id: busy
  triggers:
    - trigger: event
      event_type: check
  conditions:
    - condition: or
      conditions:
        - condition: numeric_state
          entity_id: sensor.ombi_pending_requests
          above: 2
        - condition: and
          conditions:
            - condition: state
              entity_id: device_tracker.phone
              state: home
            - condition: template
              value_template: "{{ is_state('device_tracker.tablet', 'home') }}"
  actions:
    - action: test.automation
"#,
            app.clone(),
        );

        app.state_machine.set("sensor.ombi_pending_requests".into(), "1".into(), Attributes::new());
        assert!(fire(&engine, "check").is_empty());

        app.state_machine.set("device_tracker.phone".into(), "home".into(), Attributes::new());
        app.state_machine.set("device_tracker.tablet".into(), "home".into(), Attributes::new());
        assert_eq!(fire(&engine, "check"), vec!["busy"]);

        app.state_machine.set("device_tracker.tablet".into(), "not_home".into(), Attributes::new());
        app.state_machine.set("sensor.ombi_pending_requests".into(), "3".into(), Attributes::new());
        assert_eq!(fire(&engine, "check"), vec!["busy"]);

        app.state_machine.set("sensor.ombi_pending_requests".into(), "unknown".into(), Attributes::new());
        assert!(fire(&engine, "check").is_empty());
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_event_data_filter() {
        let app = Arc::new(AppState::for_tests());
        let (engine, _calls) = engine_with(
            r#"
- id: filtered
  triggers:
    - trigger: event
      event_type: button
      event_data:
        id: front
  actions:
    - action: test.automation
"#,
            app,
        );
        let event = |data: Value| Event {
            event_type: "button".into(),
            data,
            time_fired: chrono::Utc::now(),
        };
        assert!(engine.on_event(&event(json!({"id": "back"}))).is_empty());
        assert_eq!(engine.on_event(&event(json!({"id": "front", "x": 1}))), vec!["filtered"]);
    }

    #[test]
    fn test_device_condition_unknown_domain_fails() {
        let app = Arc::new(AppState::for_tests());
        let (engine, calls) = engine_with(
            r#"
- id: nowhere
  triggers:
    - trigger: event
      event_type: go
  conditions:
    - condition: device
      domain: hue
      type: is_on
      device_id: abc
  actions:
    - action: test.automation
"#,
            app,
        );
        assert_eq!(engine.validate_device_conditions(), 1);
        assert!(fire(&engine, "go").is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_zwave_node_status_conditions() {
        let app = Arc::new(AppState::for_tests());
        let network = Arc::new(ZwaveNetwork::new(app.clone()));
        network.add_node(lock_schlage_be469());

        let automation = |n: u32, status: &str| {
            format!(
                r#"
- id: node_status_{status}
  triggers:
    - trigger: event
      event_type: test_event{n}
  conditions:
    - condition: device
      domain: zwave_js
      device_id: {device}
      type: node_status
      status: {status}
  actions:
    - action: test.automation
      data:
        some: "{status} - {{{{ trigger.platform }}}} - {{{{ trigger.event.event_type }}}}"
"#,
                n = n,
                status = status,
                device = LOCK_DEVICE_ID
            )
        };
        let yaml = [
            automation(1, "alive"),
            automation(2, "awake"),
            automation(3, "asleep"),
            automation(4, "dead"),
        ]
        .concat();

        let (mut engine, calls) = engine_with(&yaml, app);
        engine.register_device_conditions(DOMAIN, Arc::new(ZwaveDeviceConditions::new(network.clone())));
        assert_eq!(engine.validate_device_conditions(), 0);

        let fire_all = |engine: &AutomationEngine| {
            for n in 1..=4 {
                fire(engine, &format!("test_event{}", n));
            }
        };

        fire_all(&engine);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![json!({"some": "alive - event - test_event1"})]
        );

        for (event, expected) in [
            ("wake up", "awake - event - test_event2"),
            ("sleep", "asleep - event - test_event3"),
            ("dead", "dead - event - test_event4"),
        ] {
            calls.lock().unwrap().clear();
            node_event(&network, event);
            fire_all(&engine);
            assert_eq!(*calls.lock().unwrap(), vec![json!({ "some": expected })]);
        }
    }

    #[test]
    fn test_zwave_value_condition_follows_updates() {
        let app = Arc::new(AppState::for_tests());
        let network = Arc::new(ZwaveNetwork::new(app.clone()));
        network.add_node(lock_schlage_be469());

        let yaml = format!(
            r#"
- id: locked
  triggers:
    - trigger: event
      event_type: check
  conditions:
    - condition: device
      domain: zwave_js
      device_id: {}
      type: value
      command_class: 98
      property: currentMode
      value: "255"
  actions:
    - action: test.automation
"#,
            LOCK_DEVICE_ID
        );
        let (mut engine, calls) = engine_with(&yaml, app);
        engine.register_device_conditions(DOMAIN, Arc::new(ZwaveDeviceConditions::new(network.clone())));

        assert_eq!(fire(&engine, "check"), vec!["locked"]);

        let event: NodeEvent = serde_json::from_value(json!({
            "event": "value updated",
            "nodeId": 20,
            "args": {"commandClass": 98, "endpoint": 0, "property": "currentMode", "newValue": 0}
        }))
        .unwrap();
        assert!(network.receive_event(&event));
        assert!(fire(&engine, "check").is_empty());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_reacts_to_bus_events() {
        let app = Arc::new(AppState::for_tests());
        let (engine, calls) = engine_with(
            r#"
- id: bus
  triggers:
    - trigger: event
      event_type: ping
  actions:
    - action: test.automation
      data:
        type: "{{ trigger.event.event_type }}"
"#,
            app.clone(),
        );
        let engine = Arc::new(engine);
        let task = tokio::spawn(engine.clone().run());

        for _ in 0..100 {
            if app.event_bus.fire("ping", json!({})) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        for _ in 0..100 {
            if !calls.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(calls.lock().unwrap()[0], json!({"type": "ping"}));
        task.abort();

        // Separate bus, no listeners.
        assert_eq!(EventBus::new(4).fire("ping", json!({})), 0);
    }
}

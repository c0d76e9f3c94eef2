//! Device conditions for Z-Wave JS nodes.
//!
//! Three condition types:
//! - `node_status`: the node is asleep, awake, dead or alive;
//! - `config_parameter`: a configuration parameter has a value;
//! - `value`: any value, addressed by command class, property, property key
//!   and endpoint, has a value.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    key_str, value_id, ConfigurationValueType, NodeStatus, ZwaveNetwork, ZwaveNode, ZwaveValue,
    DOMAIN,
};
use crate::automation::{ConditionChecker, DeviceConditionPlatform};
use crate::error::ConditionError;

pub const NODE_STATUS_TYPE: &str = "node_status";
pub const CONFIG_PARAMETER_TYPE: &str = "config_parameter";
pub const VALUE_TYPE: &str = "value";
pub const CONDITION_TYPES: [&str; 3] = [NODE_STATUS_TYPE, CONFIG_PARAMETER_TYPE, VALUE_TYPE];

const NODE_STATUSES: [NodeStatus; 4] = [
    NodeStatus::Asleep,
    NodeStatus::Awake,
    NodeStatus::Dead,
    NodeStatus::Alive,
];

/// Addresses one value of a node.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueSelector {
    pub command_class: u32,
    pub property: Value,
    #[serde(default)]
    pub property_key: Option<Value>,
    #[serde(default)]
    pub endpoint: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ZwaveCondition {
    NodeStatus {
        device_id: String,
        status: NodeStatus,
    },
    ConfigParameter {
        device_id: String,
        value_id: String,
        value: Value,
    },
    Value {
        device_id: String,
        command_class: u32,
        property: Value,
        #[serde(default)]
        property_key: Option<Value>,
        #[serde(default)]
        endpoint: Option<Value>,
        value: Value,
    },
}

impl ZwaveCondition {
    pub fn device_id(&self) -> &str {
        match self {
            ZwaveCondition::NodeStatus { device_id, .. }
            | ZwaveCondition::ConfigParameter { device_id, .. }
            | ZwaveCondition::Value { device_id, .. } => device_id,
        }
    }

    /// Evaluate against the current node state.
    pub fn evaluate(&self, node: &ZwaveNode) -> Result<bool, ConditionError> {
        match self {
            ZwaveCondition::NodeStatus { status, .. } => Ok(node.status == *status),
            ZwaveCondition::ConfigParameter { value_id, value, .. } => {
                let current = node.value(value_id).ok_or_else(|| {
                    ConditionError::InvalidConfig(format!(
                        "value {} not found on node {}",
                        value_id, node.node_id
                    ))
                })?;
                Ok(values_match(&current.value, value))
            }
            ZwaveCondition::Value {
                command_class,
                property,
                property_key,
                endpoint,
                value,
                ..
            } => {
                let selector = ValueSelector {
                    command_class: *command_class,
                    property: property.clone(),
                    property_key: property_key.clone(),
                    endpoint: endpoint.clone(),
                };
                let current = get_value_from_config(node, &selector)?;
                Ok(values_match(&current.value, value))
            }
        }
    }
}

/// Equal as JSON, or equal once both sides are rendered as strings
/// (`255` matches `"255"`).
pub fn values_match(current: &Value, expected: &Value) -> bool {
    current == expected || key_str(current) == key_str(expected)
}

fn parse_endpoint(endpoint: Option<&Value>) -> Result<u32, ConditionError> {
    match endpoint {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ConditionError::InvalidConfig(format!("invalid endpoint {}", n))),
        Some(Value::String(s)) if s.is_empty() => Ok(0),
        Some(Value::String(s)) => s
            .parse()
            .map_err(|_| ConditionError::InvalidConfig(format!("invalid endpoint {}", s))),
        Some(other) => Err(ConditionError::InvalidConfig(format!("invalid endpoint {}", other))),
    }
}

/// Resolve the value a `value` condition points at.
pub fn get_value_from_config<'a>(
    node: &'a ZwaveNode,
    selector: &ValueSelector,
) -> Result<&'a ZwaveValue, ConditionError> {
    let endpoint = parse_endpoint(selector.endpoint.as_ref())?;
    let property_key = selector
        .property_key
        .as_ref()
        .filter(|k| !k.is_null() && k.as_str() != Some(""));
    let id = value_id(
        node.node_id,
        selector.command_class,
        endpoint,
        &selector.property,
        property_key,
    );
    node.value(&id).ok_or_else(|| {
        ConditionError::InvalidConfig(format!("Value {} can't be found on node {}", id, node.node_id))
    })
}

fn condition_type(config: &Map<String, Value>) -> Result<&str, ConditionError> {
    let kind = config.get("type").and_then(Value::as_str).unwrap_or_default();
    if CONDITION_TYPES.contains(&kind) {
        Ok(kind)
    } else {
        Err(ConditionError::InvalidType(kind.to_string()))
    }
}

fn extra_fields(fields: Vec<Value>) -> Map<String, Value> {
    let mut capabilities = Map::new();
    capabilities.insert("extra_fields".into(), Value::Array(fields));
    capabilities
}

/// Device conditions backed by a [`ZwaveNetwork`].
pub struct ZwaveDeviceConditions {
    network: Arc<ZwaveNetwork>,
}

impl ZwaveDeviceConditions {
    pub fn new(network: Arc<ZwaveNetwork>) -> Self {
        Self { network }
    }

    fn node(&self, device_id: &str) -> Result<ZwaveNode, ConditionError> {
        self.network
            .node_for_device(device_id)
            .ok_or_else(|| ConditionError::DeviceNotFound(device_id.to_string()))
    }

    fn config_parameter_fields(node: &ZwaveNode, value_id: &str) -> Option<Vec<Value>> {
        let value = node.value(value_id)?;
        let meta = &value.metadata;
        let field = match meta.configuration_value_type() {
            ConfigurationValueType::Enumerated => {
                let options: Vec<Value> = meta
                    .sorted_states()
                    .into_iter()
                    .map(|(state, label)| json!([state, label]))
                    .collect();
                json!({"name": "value", "required": true, "options": options, "type": "select"})
            }
            ConfigurationValueType::Range => {
                json!({"name": "value", "required": true, "valueMin": meta.min, "valueMax": meta.max})
            }
            ConfigurationValueType::ManualEntry => {
                let mut field = json!({"name": "value", "required": true, "type": "integer"});
                if let Some(min) = meta.min {
                    field["valueMin"] = json!(min);
                }
                if let Some(max) = meta.max {
                    field["valueMax"] = json!(max);
                }
                field
            }
            ConfigurationValueType::Undefined => return None,
        };
        Some(vec![field])
    }
}

impl DeviceConditionPlatform for ZwaveDeviceConditions {
    fn get_conditions(&self, device_id: &str) -> Result<Vec<Map<String, Value>>, ConditionError> {
        let node = self.node(device_id)?;
        let base = |kind: &str| {
            let mut condition = Map::new();
            condition.insert("condition".into(), json!("device"));
            condition.insert("domain".into(), json!(DOMAIN));
            condition.insert("type".into(), json!(kind));
            condition.insert("device_id".into(), json!(device_id));
            condition
        };

        let mut conditions = vec![base(NODE_STATUS_TYPE)];
        for value in node.configuration_values() {
            let id = value.value_id(node.node_id);
            let mut condition = base(CONFIG_PARAMETER_TYPE);
            condition.insert("subtype".into(), json!(format!("{} ({})", id, value.property_name())));
            condition.insert("value_id".into(), json!(id));
            conditions.push(condition);
        }
        conditions.push(base(VALUE_TYPE));
        Ok(conditions)
    }

    fn condition_capabilities(&self, config: &Map<String, Value>) -> Map<String, Value> {
        let Ok(kind) = condition_type(config) else {
            return Map::new();
        };
        let device_id = config.get("device_id").and_then(Value::as_str).unwrap_or_default();
        let Ok(node) = self.node(device_id) else {
            return Map::new();
        };

        match kind {
            NODE_STATUS_TYPE => {
                let options: Vec<Value> = NODE_STATUSES
                    .iter()
                    .map(|s| json!([s.as_str(), s.as_str()]))
                    .collect();
                extra_fields(vec![
                    json!({"name": "status", "required": true, "type": "select", "options": options}),
                ])
            }
            CONFIG_PARAMETER_TYPE => {
                let value_id = config.get("value_id").and_then(Value::as_str).unwrap_or_default();
                Self::config_parameter_fields(&node, value_id)
                    .map(extra_fields)
                    .unwrap_or_default()
            }
            VALUE_TYPE => {
                let cc_options: Vec<Value> = node
                    .command_classes
                    .iter()
                    .map(|cc| json!([cc.id, cc.name]))
                    .collect();
                extra_fields(vec![
                    json!({"name": "command_class", "required": true, "options": cc_options, "type": "select"}),
                    json!({"name": "property", "required": true, "type": "string"}),
                    json!({"name": "property_key", "optional": true, "type": "string"}),
                    json!({"name": "endpoint", "optional": true, "type": "string"}),
                    json!({"name": "value", "required": true, "type": "string"}),
                ])
            }
            _ => Map::new(),
        }
    }

    fn condition_from_config(&self, config: &Map<String, Value>) -> Result<ConditionChecker, ConditionError> {
        condition_type(config)?;
        let condition: ZwaveCondition = serde_json::from_value(Value::Object(config.clone()))?;
        // Unknown devices are rejected up front, values are resolved on every check.
        self.node(condition.device_id())?;

        let network = self.network.clone();
        Ok(Box::new(move || {
            let Some(node) = network.node_for_device(condition.device_id()) else {
                tracing::warn!("zwave: device {} disappeared", condition.device_id());
                return false;
            };
            match condition.evaluate(&node) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("zwave: condition check failed: {}", e);
                    false
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::api::AppState;

    fn platform() -> ZwaveDeviceConditions {
        let network = Arc::new(ZwaveNetwork::new(Arc::new(AppState::for_tests())));
        network.add_node(lock_schlage_be469());
        network.add_node(climate_radio_thermostat_ct100_plus());
        ZwaveDeviceConditions::new(network)
    }

    fn config(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_get_conditions() {
        let conditions = platform().get_conditions(LOCK_DEVICE_ID).unwrap();
        let expected = [
            json!({"condition": "device", "domain": "zwave_js", "type": "node_status",
                   "device_id": LOCK_DEVICE_ID}),
            json!({"condition": "device", "domain": "zwave_js", "type": "config_parameter",
                   "device_id": LOCK_DEVICE_ID, "value_id": "20-112-0-3",
                   "subtype": "20-112-0-3 (Beeper)"}),
            json!({"condition": "device", "domain": "zwave_js", "type": "value",
                   "device_id": LOCK_DEVICE_ID}),
        ];
        for condition in expected {
            assert!(conditions.contains(&config(condition)));
        }
        assert_eq!(conditions.len(), 4);
    }

    #[test]
    fn test_get_conditions_unknown_device() {
        assert!(matches!(
            platform().get_conditions("nope"),
            Err(ConditionError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_node_status_checks() {
        let platform = platform();
        let check = |status: &str| {
            platform
                .condition_from_config(&config(json!({
                    "condition": "device", "domain": "zwave_js", "device_id": LOCK_DEVICE_ID,
                    "type": "node_status", "status": status
                })))
                .unwrap()()
        };
        assert!(check("alive"));
        assert!(!check("awake"));

        platform.network.receive_event(
            &serde_json::from_value(json!({"source": "node", "event": "wake up", "nodeId": 20})).unwrap(),
        );
        assert!(check("awake"));
        assert!(!check("alive"));
    }

    #[test]
    fn test_config_parameter_checks() {
        let platform = platform();
        let beeper = platform
            .condition_from_config(&config(json!({
                "type": "config_parameter", "device_id": LOCK_DEVICE_ID,
                "value_id": "20-112-0-3", "subtype": "20-112-0-3 (Beeper)", "value": 255
            })))
            .unwrap();
        let slot = platform
            .condition_from_config(&config(json!({
                "type": "config_parameter", "device_id": LOCK_DEVICE_ID,
                "value_id": "20-112-0-6", "subtype": "20-112-0-6 (User Slot Status)", "value": 1
            })))
            .unwrap();
        assert!(beeper());
        assert!(!slot());

        for (property, new_value) in [(3, 0), (6, 1)] {
            platform.network.receive_event(
                &serde_json::from_value(json!({
                    "source": "node", "event": "value updated", "nodeId": 20,
                    "args": {"commandClassName": "Configuration", "commandClass": 112,
                             "endpoint": 0, "property": property, "newValue": new_value}
                }))
                .unwrap(),
            );
        }
        assert!(!beeper());
        assert!(slot());
    }

    #[test]
    fn test_value_check_compares_loosely() {
        let platform = platform();
        let check = |value: Value, endpoint: Value| {
            platform
                .condition_from_config(&config(json!({
                    "type": "value", "device_id": LOCK_DEVICE_ID,
                    "command_class": 112, "property": 3, "endpoint": endpoint, "value": value
                })))
                .unwrap()()
        };
        assert!(check(json!(255), Value::Null));
        assert!(check(json!("255"), json!("0")));
        assert!(!check(json!(0), json!(0)));
    }

    #[test]
    fn test_capabilities_node_status() {
        let caps = platform().condition_capabilities(&config(json!({
            "platform": "device", "domain": "zwave_js", "device_id": LOCK_DEVICE_ID,
            "type": "node_status"
        })));
        assert_eq!(
            Value::Object(caps),
            json!({"extra_fields": [{
                "name": "status", "required": true, "type": "select",
                "options": [["asleep", "asleep"], ["awake", "awake"], ["dead", "dead"], ["alive", "alive"]]
            }]})
        );
    }

    #[test]
    fn test_capabilities_value() {
        let caps = platform().condition_capabilities(&config(json!({
            "platform": "device", "domain": "zwave_js", "device_id": LOCK_DEVICE_ID, "type": "value"
        })));
        assert_eq!(
            Value::Object(caps),
            json!({"extra_fields": [
                {"name": "command_class", "required": true, "type": "select", "options": [
                    [133, "ASSOCIATION"], [128, "BATTERY"], [112, "CONFIGURATION"],
                    [98, "DOOR_LOCK"], [122, "FIRMWARE_UPDATE_MD"], [114, "MANUFACTURER_SPECIFIC"],
                    [113, "ALARM"], [152, "SECURITY"], [99, "USER_CODE"], [134, "VERSION"]
                ]},
                {"name": "property", "required": true, "type": "string"},
                {"name": "property_key", "optional": true, "type": "string"},
                {"name": "endpoint", "optional": true, "type": "string"},
                {"name": "value", "required": true, "type": "string"}
            ]})
        );
    }

    #[test]
    fn test_capabilities_config_parameter() {
        let platform = platform();
        let caps = |value_id: &str| {
            Value::Object(platform.condition_capabilities(&config(json!({
                "platform": "device", "domain": "zwave_js", "device_id": THERMOSTAT_DEVICE_ID,
                "type": "config_parameter", "value_id": value_id
            }))))
        };

        assert_eq!(
            caps("13-112-0-1"),
            json!({"extra_fields": [{
                "name": "value", "required": true, "type": "select",
                "options": [[0, "Disabled"], [1, "0.5° F"], [2, "1.0° F"], [3, "1.5° F"], [4, "2.0° F"]]
            }]})
        );
        assert_eq!(
            caps("13-112-0-10"),
            json!({"extra_fields": [{"name": "value", "required": true, "valueMin": 0, "valueMax": 124}]})
        );
        assert_eq!(
            caps("13-112-0-11"),
            json!({"extra_fields": [{"name": "value", "required": true, "type": "integer",
                                     "valueMin": 0, "valueMax": 1}]})
        );
        assert_eq!(caps("13-112-0-2"), json!({}));
        assert_eq!(caps("13-112-0-99"), json!({}));
    }

    #[test]
    fn test_failure_scenarios() {
        let platform = platform();
        assert!(matches!(
            platform.condition_from_config(&config(json!({"type": "failed.test", "device_id": LOCK_DEVICE_ID}))),
            Err(ConditionError::InvalidType(t)) if t == "failed.test"
        ));
        assert!(platform
            .condition_capabilities(&config(json!({"type": "failed.test", "device_id": LOCK_DEVICE_ID})))
            .is_empty());
        assert!(platform
            .condition_capabilities(&config(json!({"type": "node_status", "device_id": "missing"})))
            .is_empty());
        assert!(matches!(
            platform.condition_from_config(&config(json!({
                "type": "node_status", "device_id": "missing", "status": "alive"
            }))),
            Err(ConditionError::DeviceNotFound(_))
        ));
        assert!(matches!(
            platform.condition_from_config(&config(json!({
                "type": "node_status", "device_id": LOCK_DEVICE_ID, "status": "sleeping"
            }))),
            Err(ConditionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_get_value_from_config_failure() {
        let node = lock_schlage_be469();
        let selector: ValueSelector = serde_json::from_value(json!({
            "command_class": 43, "property": "sceneId", "property_key": 15, "endpoint": 10
        }))
        .unwrap();
        assert!(matches!(
            get_value_from_config(&node, &selector),
            Err(ConditionError::InvalidConfig(_))
        ));

        let selector: ValueSelector = serde_json::from_value(json!({
            "command_class": 99, "property": "userCode", "property_key": 1
        }))
        .unwrap();
        assert_eq!(get_value_from_config(&node, &selector).unwrap().value, json!("1234"));
    }
}

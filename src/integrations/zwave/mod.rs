//! Z-Wave JS node model.
//!
//! Nodes are loaded from a JSON snapshot of the Z-Wave JS server state and
//! kept current by feeding node events (`wake up`, `sleep`, `dead`, `alive`,
//! `value updated`) through [`ZwaveNetwork::receive_event`]. Device
//! conditions in [`device_condition`] read from here.

pub mod device_condition;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::AppState;
use crate::state::{slugify, Attributes};

pub const DOMAIN: &str = "zwave_js";
pub const COMMAND_CLASS_CONFIGURATION: u32 = 112;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Unknown,
    Asleep,
    Awake,
    Dead,
    Alive,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Asleep => "asleep",
            NodeStatus::Awake => "awake",
            NodeStatus::Dead => "dead",
            NodeStatus::Alive => "alive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandClassInfo {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueMetadata {
    #[serde(default, rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    /// Enumerated states, raw value -> label.
    #[serde(default)]
    pub states: BTreeMap<String, String>,
    #[serde(default)]
    pub allow_manual_entry: bool,
}

/// How a configuration parameter accepts values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationValueType {
    ManualEntry,
    Enumerated,
    Range,
    Undefined,
}

impl ValueMetadata {
    pub fn configuration_value_type(&self) -> ConfigurationValueType {
        if self.value_type == "number" && self.allow_manual_entry && self.states.is_empty() {
            ConfigurationValueType::ManualEntry
        } else if !self.states.is_empty() {
            ConfigurationValueType::Enumerated
        } else if self.min.is_some() || self.max.is_some() {
            ConfigurationValueType::Range
        } else {
            ConfigurationValueType::Undefined
        }
    }

    /// Enumerated states in numeric order where the keys are numbers.
    pub fn sorted_states(&self) -> Vec<(Value, String)> {
        let mut states: Vec<(Value, String)> = self
            .states
            .iter()
            .map(|(k, label)| {
                let key = k
                    .parse::<i64>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::from(k.clone()));
                (key, label.clone())
            })
            .collect();
        states.sort_by(|a, b| match (a.0.as_i64(), b.0.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => a.0.to_string().cmp(&b.0.to_string()),
        });
        states
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZwaveValue {
    pub command_class: u32,
    #[serde(default)]
    pub command_class_name: String,
    #[serde(default)]
    pub endpoint: u32,
    /// Number or string.
    pub property: Value,
    #[serde(default)]
    pub property_key: Option<Value>,
    #[serde(default)]
    pub property_name: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub metadata: ValueMetadata,
}

/// Render a property or property key the way value ids spell it.
pub fn key_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `{node}-{cc}-{endpoint}-{property}[-{property_key}]`
pub fn value_id(
    node_id: u32,
    command_class: u32,
    endpoint: u32,
    property: &Value,
    property_key: Option<&Value>,
) -> String {
    let mut id = format!("{}-{}-{}-{}", node_id, command_class, endpoint, key_str(property));
    if let Some(key) = property_key.filter(|k| !k.is_null()) {
        id.push('-');
        id.push_str(&key_str(key));
    }
    id
}

impl ZwaveValue {
    pub fn value_id(&self, node_id: u32) -> String {
        value_id(
            node_id,
            self.command_class,
            self.endpoint,
            &self.property,
            self.property_key.as_ref(),
        )
    }

    /// Display name of the property, falling back to the raw property.
    pub fn property_name(&self) -> String {
        self.property_name
            .clone()
            .unwrap_or_else(|| key_str(&self.property))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZwaveNode {
    pub node_id: u32,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub command_classes: Vec<CommandClassInfo>,
    #[serde(default)]
    pub values: Vec<ZwaveValue>,
}

/// A node event from the Z-Wave JS server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEvent {
    pub event: String,
    pub node_id: u32,
    #[serde(default)]
    pub args: Option<ValueUpdatedArgs>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueUpdatedArgs {
    pub command_class: u32,
    #[serde(default)]
    pub endpoint: u32,
    pub property: Value,
    #[serde(default)]
    pub property_key: Option<Value>,
    pub new_value: Value,
}

impl ZwaveNode {
    pub fn value(&self, value_id: &str) -> Option<&ZwaveValue> {
        self.values.iter().find(|v| v.value_id(self.node_id) == value_id)
    }

    /// Configuration (CC 112) values in node order.
    pub fn configuration_values(&self) -> impl Iterator<Item = &ZwaveValue> {
        self.values
            .iter()
            .filter(|v| v.command_class == COMMAND_CLASS_CONFIGURATION)
    }

    /// Apply a node event. Returns whether anything changed.
    pub fn receive_event(&mut self, event: &NodeEvent) -> bool {
        let status = match event.event.as_str() {
            "wake up" => Some(NodeStatus::Awake),
            "sleep" => Some(NodeStatus::Asleep),
            "dead" => Some(NodeStatus::Dead),
            "alive" => Some(NodeStatus::Alive),
            "value updated" => None,
            other => {
                tracing::debug!(node_id = self.node_id, "zwave: ignoring node event {}", other);
                return false;
            }
        };
        if let Some(status) = status {
            self.status = status;
            return true;
        }

        let Some(args) = &event.args else {
            tracing::warn!(node_id = self.node_id, "zwave: value updated without args");
            return false;
        };
        let id = value_id(
            self.node_id,
            args.command_class,
            args.endpoint,
            &args.property,
            args.property_key.as_ref(),
        );
        let node_id = self.node_id;
        match self.values.iter_mut().find(|v| v.value_id(node_id) == id) {
            Some(value) => {
                value.value = args.new_value.clone();
                true
            }
            None => {
                tracing::debug!(node_id, "zwave: update for unknown value {}", id);
                false
            }
        }
    }
}

/// All known nodes, keyed by node id.
pub struct ZwaveNetwork {
    nodes: DashMap<u32, ZwaveNode>,
    app: Arc<AppState>,
}

impl ZwaveNetwork {
    pub fn new(app: Arc<AppState>) -> Self {
        Self {
            nodes: DashMap::new(),
            app,
        }
    }

    /// Load nodes from a JSON array snapshot.
    pub fn load(&self, path: &Path) -> anyhow::Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let nodes: Vec<ZwaveNode> = serde_json::from_str(&contents)?;
        let count = nodes.len();
        for node in nodes {
            self.add_node(node);
        }
        tracing::info!("zwave: loaded {} nodes from {}", count, path.display());
        Ok(count)
    }

    pub fn add_node(&self, mut node: ZwaveNode) {
        if node.device_id.is_empty() {
            node.device_id = format!("{}_node_{}", DOMAIN, node.node_id);
        }
        self.publish_status(&node);
        self.nodes.insert(node.node_id, node);
    }

    pub fn node(&self, node_id: u32) -> Option<ZwaveNode> {
        self.nodes.get(&node_id).map(|n| n.value().clone())
    }

    pub fn node_for_device(&self, device_id: &str) -> Option<ZwaveNode> {
        self.nodes
            .iter()
            .find(|n| n.device_id == device_id)
            .map(|n| n.value().clone())
    }

    pub fn nodes(&self) -> Vec<ZwaveNode> {
        let mut nodes: Vec<ZwaveNode> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Route a node event to its node.
    pub fn receive_event(&self, event: &NodeEvent) -> bool {
        let updated = {
            let Some(mut node) = self.nodes.get_mut(&event.node_id) else {
                tracing::debug!("zwave: event for unknown node {}", event.node_id);
                return false;
            };
            if !node.receive_event(event) {
                return false;
            }
            node.clone()
        };
        self.publish_status(&updated);
        true
    }

    /// `sensor.<node>_node_status`
    fn publish_status(&self, node: &ZwaveNode) {
        let name = if node.name.is_empty() {
            format!("Node {}", node.node_id)
        } else {
            node.name.clone()
        };
        let mut attrs = Attributes::new();
        attrs.insert("friendly_name".into(), serde_json::json!(format!("{}: Node status", name)));
        attrs.insert("node_id".into(), serde_json::json!(node.node_id));
        attrs.insert("device_id".into(), serde_json::json!(node.device_id));
        self.app.state_machine.set(
            format!("sensor.{}_node_status", slugify(&name)),
            node.status.as_str().to_string(),
            attrs,
        );
    }
}

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

pub const STATE_UNKNOWN: &str = "unknown";
pub const STATE_HOME: &str = "home";
pub const STATE_NOT_HOME: &str = "not_home";

pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// A single entity's published state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_reported: DateTime<Utc>,
    pub context: Context,
}

impl EntityState {
    /// The entity domain, i.e. the part of the id before the first dot.
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or(&self.entity_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast whenever an entity is written.
#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: EntityState,
}

/// Entity state store shared by every integration.
pub struct StateMachine {
    states: Arc<DashMap<String, EntityState>>,
    event_tx: broadcast::Sender<StateChangedEvent>,
}

impl StateMachine {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity);
        Self {
            states: Arc::new(DashMap::new()),
            event_tx,
        }
    }

    pub fn get_all(&self) -> Vec<EntityState> {
        let mut all: Vec<EntityState> = self
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|entry| entry.value().clone())
    }

    /// Write an entity state and fire `state_changed`.
    ///
    /// `last_changed` only moves when the state string changes, `last_updated`
    /// when either the state or the attributes change.
    pub fn set(&self, entity_id: String, state: String, attributes: Attributes) -> EntityState {
        let now = Utc::now();
        let old_state = self.states.get(&entity_id).map(|e| e.value().clone());

        let (last_changed, last_updated) = match &old_state {
            Some(prev) => {
                let changed = if prev.state != state {
                    now
                } else {
                    prev.last_changed
                };
                let updated = if prev.state != state || prev.attributes != attributes {
                    now
                } else {
                    prev.last_updated
                };
                (changed, updated)
            }
            None => (now, now),
        };

        let new_state = EntityState {
            entity_id: entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated,
            last_reported: now,
            context: Context::new(),
        };

        self.states.insert(entity_id.clone(), new_state.clone());

        // No subscribers is fine
        let _ = self.event_tx.send(StateChangedEvent {
            entity_id,
            old_state,
            new_state: new_state.clone(),
        });

        new_state
    }

    pub fn remove(&self, entity_id: &str) -> bool {
        self.states.remove(entity_id).is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.event_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}

/// A non-state event, e.g. one posted to `/api/events/<event_type>`.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: String,
    pub data: serde_json::Value,
    pub time_fired: DateTime<Utc>,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(channel_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(channel_capacity);
        Self { tx }
    }

    /// Fire an event. Returns the number of listeners that received it.
    pub fn fire(&self, event_type: &str, data: serde_json::Value) -> usize {
        self.tx
            .send(Event {
                event_type: event_type.to_string(),
                data,
                time_fired: Utc::now(),
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

/// Convert a name to an entity-id-safe slug.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

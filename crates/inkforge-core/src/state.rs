//! Workflow state
//!
//! State is a JSON-serializable mapping from channel names to values. Every
//! workflow extends a base shape (task id, workflow type, mode, step/retry
//! bookkeeping) with its own channels. State must round-trip through
//! serialization, so values are plain JSON: no functions, no cycles.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::channel::ChannelSet;
use crate::graph::START;

/// Well-known base channel names
pub mod keys {
    pub const TASK_ID: &str = "task_id";
    pub const WORKFLOW_TYPE: &str = "workflow_type";
    pub const MODE: &str = "mode";
    pub const CURRENT_STEP: &str = "current_step";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const VERSION: &str = "version";
    pub const START_TIME: &str = "start_time";
    pub const METADATA: &str = "metadata";
    pub const ERROR: &str = "error";
}

/// A partial state update returned by a node handler
///
/// Only the channels present in the update are touched; each write passes
/// through the channel's reducer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct StateUpdate {
    entries: BTreeMap<String, Value>,
}

impl StateUpdate {
    /// Create an empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel write (builder style)
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), value);
        self
    }

    /// Whether the update touches no channels
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate the writes
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }
}

impl FromIterator<(String, Value)> for StateUpdate {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// The in-flight state of a workflow run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct WorkflowState {
    values: BTreeMap<String, Value>,
}

impl WorkflowState {
    /// Create an empty state
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Create the base state every workflow starts from
    pub fn base(task_id: Uuid, workflow_type: &str, mode: &str) -> Self {
        let mut state = Self::new();
        state.insert(keys::TASK_ID, Value::String(task_id.to_string()));
        state.insert(keys::WORKFLOW_TYPE, Value::String(workflow_type.to_string()));
        state.insert(keys::MODE, Value::String(mode.to_string()));
        state.insert(keys::CURRENT_STEP, Value::String(START.to_string()));
        state.insert(keys::RETRY_COUNT, Value::from(0));
        state.insert(keys::VERSION, Value::from(0));
        state.insert(keys::START_TIME, Value::String(Utc::now().to_rfc3339()));
        state.insert(keys::METADATA, Value::Object(Default::default()));
        state
    }

    /// Seed declared channels with their default values (existing keys win)
    pub fn with_channel_defaults(mut self, channels: &ChannelSet) -> Self {
        for (name, default) in channels.defaults() {
            self.values.entry(name).or_insert(default);
        }
        self
    }

    /// Raw read of a channel
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Read a channel as a string slice
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    /// Read a channel, deserializing into a concrete type
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Read a counter channel (missing or non-numeric reads as 0)
    pub fn counter(&self, key: &str) -> i64 {
        self.values.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
    }

    /// Raw write of a channel (bypasses reducers; used by the runtime)
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Apply a partial update through the channel reducers
    pub fn apply(&mut self, update: &StateUpdate, channels: &ChannelSet) {
        for (key, new_value) in update.iter() {
            let reducer = channels.reducer_for(key);
            let merged = reducer.reduce(self.values.get(key), Some(new_value));
            self.values.insert(key.clone(), merged);
        }
    }

    /// The task id, when the base shape is present
    pub fn task_id(&self) -> Option<Uuid> {
        self.get_str(keys::TASK_ID).and_then(|s| s.parse().ok())
    }

    /// The workflow type, when the base shape is present
    pub fn workflow_type(&self) -> Option<&str> {
        self.get_str(keys::WORKFLOW_TYPE)
    }

    /// The last committed step name
    pub fn current_step(&self) -> &str {
        self.get_str(keys::CURRENT_STEP).unwrap_or(START)
    }

    /// Set the last committed step name
    pub fn set_current_step(&mut self, step: &str) {
        self.insert(keys::CURRENT_STEP, Value::String(step.to_string()));
    }

    /// The in-state version counter (incremented once per committed step)
    pub fn version(&self) -> i64 {
        self.counter(keys::VERSION)
    }

    /// Increment the in-state version counter
    pub fn bump_version(&mut self) {
        let next = self.version() + 1;
        self.insert(keys::VERSION, Value::from(next));
    }

    /// The error channel, when set by a failed node
    pub fn error_message(&self) -> Option<&str> {
        match self.values.get(keys::ERROR) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Serialize to a JSON value (for snapshots)
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Restore from a snapshot value
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Number of channels currently present
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the state holds no channels
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}

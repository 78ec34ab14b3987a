//! State channels and reducers
//!
//! A channel is a named field in the workflow state with a default value and
//! a reducer. Node handlers return partial updates; the reducer defines how a
//! new write combines with the previous value of the channel.

use std::collections::BTreeMap;

use serde_json::Value;

/// How successive writes to a channel combine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    /// Keep the new value when one is written, otherwise keep the previous
    LastWriteWins,

    /// Like [`Reducer::LastWriteWins`] but an absent previous value reads as 0.
    ///
    /// Handlers increment by reading the previous count and writing
    /// `prev + delta`; the reducer itself never adds.
    Counter,

    /// Concatenate the new value (array or single element) onto the previous
    /// array
    Append,
}

impl Reducer {
    /// Combine a previous value with a new write
    pub fn reduce(&self, prev: Option<&Value>, new: Option<&Value>) -> Value {
        match self {
            Reducer::LastWriteWins => match new {
                Some(v) => v.clone(),
                None => prev.cloned().unwrap_or(Value::Null),
            },
            Reducer::Counter => match new {
                Some(v) => v.clone(),
                None => prev.cloned().unwrap_or_else(|| Value::from(0)),
            },
            Reducer::Append => {
                let mut items = match prev {
                    Some(Value::Array(a)) => a.clone(),
                    Some(other) if !other.is_null() => vec![other.clone()],
                    _ => vec![],
                };
                match new {
                    Some(Value::Array(a)) => items.extend(a.iter().cloned()),
                    Some(other) if !other.is_null() => items.push(other.clone()),
                    _ => {}
                }
                Value::Array(items)
            }
        }
    }
}

/// A declared state channel
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel name (the state key)
    pub name: String,

    /// Initial value when a fresh state is constructed
    pub default: Value,

    /// How writes combine
    pub reducer: Reducer,
}

impl Channel {
    /// Declare a last-write-wins channel
    pub fn value(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default,
            reducer: Reducer::LastWriteWins,
        }
    }

    /// Declare a counter channel starting at zero
    pub fn counter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: Value::from(0),
            reducer: Reducer::Counter,
        }
    }

    /// Declare an append-only list channel starting empty
    pub fn append(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: Value::Array(vec![]),
            reducer: Reducer::Append,
        }
    }
}

/// The set of channels declared by a workflow graph
///
/// Writes to undeclared keys fall back to last-write-wins; declaring a
/// channel is what buys a non-default reducer and an initial value.
#[derive(Debug, Clone, Default)]
pub struct ChannelSet {
    channels: BTreeMap<String, Channel>,
}

impl ChannelSet {
    /// Create an empty channel set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a channel set from declarations
    pub fn from_channels(channels: impl IntoIterator<Item = Channel>) -> Self {
        let mut set = Self::new();
        for ch in channels {
            set.declare(ch);
        }
        set
    }

    /// Declare (or replace) a channel
    pub fn declare(&mut self, channel: Channel) -> &mut Self {
        self.channels.insert(channel.name.clone(), channel);
        self
    }

    /// Look up the reducer for a key
    pub fn reducer_for(&self, name: &str) -> Reducer {
        self.channels
            .get(name)
            .map(|c| c.reducer)
            .unwrap_or(Reducer::LastWriteWins)
    }

    /// Default values for every declared channel
    pub fn defaults(&self) -> BTreeMap<String, Value> {
        self.channels
            .iter()
            .map(|(name, ch)| (name.clone(), ch.default.clone()))
            .collect()
    }

    /// Whether a channel is declared
    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Number of declared channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether no channels are declared
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Iterate declared channels
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }
}

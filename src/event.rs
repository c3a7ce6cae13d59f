// MIT License - Copyright (c) 2026 Peter Wright

use tokio::sync::mpsc;

use crate::devices::partition::Partition;
use crate::devices::sensor::Sensor;
use crate::devices::PanelMeta;

/// Immutable snapshot of the entity a change refers to.
///
/// Observers never see the live state: every notification carries a copy
/// taken inside the same critical section that performed the mutation.
#[derive(Debug, Clone)]
pub enum EntitySnapshot {
    Panel(PanelMeta),
    Partition(Partition),
    Sensor(Sensor),
}

/// What happened to the entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The entity was seen for the first time.
    Created,
    /// A single attribute changed value.
    AttributeChanged { field: &'static str, old: String, new: String },
    /// The entity disappeared from a panel snapshot. It stays in the model;
    /// only its availability flips.
    WentOffline,
    /// A previously offline entity reappeared in a snapshot.
    CameOnline,
}

/// A single change notification emitted by the domain model.
///
/// Within one inbound frame, changes are delivered panel-first, then per
/// partition, then per sensor within that partition, so downstream
/// publishers never have to reorder.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub entity: EntitySnapshot,
    pub change: Change,
}

impl StateChange {
    pub fn attribute(&self) -> Option<&'static str> {
        match &self.change {
            Change::AttributeChanged { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Observers register a sender; the model pushes into it synchronously
/// from `apply`. Observers that need to mutate state in response must go
/// through their own task, never back into `apply`.
pub type ObserverSender = mpsc::UnboundedSender<StateChange>;
pub type ObserverReceiver = mpsc::UnboundedReceiver<StateChange>;

/// Create a new observer channel.
pub fn observer_channel() -> (ObserverSender, ObserverReceiver) {
    mpsc::unbounded_channel()
}

// MIT License - Copyright (c) 2026 Peter Wright
// Qolsys IQ panel to MQTT bridge

//! # qolsys2mqtt
//!
//! Bridge daemon between a Qolsys IQ alarm panel (the "Control4"
//! JSON-over-TLS interface) and an MQTT broker speaking Home Assistant
//! discovery semantics.
//!
//! The moving parts, wired together by [`supervisor::Supervisor`]:
//!
//! - [`transport::PanelLink`] keeps one TLS session to the panel alive,
//!   with reconnection backoff, keep-alive probes, and a dead-man timer.
//! - [`protocol`] is the pure codec between wire JSON and typed records.
//! - [`state::PanelState`] holds the authoritative model (panel →
//!   partitions → sensors) and fans out granular change events.
//! - [`mqtt::MqttSurface`] projects the model onto retained discovery,
//!   state, and availability topics.
//! - [`mqtt::ControlPlane`] validates arm/disarm/trigger commands coming
//!   back from Home Assistant before they reach the panel.
//!
//! Data flow, steady state:
//!
//! ```text
//! panel TLS → PanelLink → decode → PanelState.apply → observers → MqttSurface → broker
//! broker → ControlPlane → validate → encode → PanelLink → panel TLS
//! ```

pub mod config;
pub mod counters;
pub mod devices;
pub mod error;
pub mod event;
pub mod mqtt;
pub mod protocol;
pub mod state;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use config::Config;
pub use counters::{Counters, CountersSnapshot};
pub use error::{ConfigError, ControlReject, LinkError, ProtocolError};
pub use event::{Change, EntitySnapshot, StateChange};
pub use mqtt::{ControlPlane, MqttSurface, MqttTransport, SessionToken};
pub use protocol::{InboundMessage, OutboundAction};
pub use state::PanelState;
pub use supervisor::Supervisor;
pub use transport::{LinkHandle, PanelLink, PanelLinkConfig};

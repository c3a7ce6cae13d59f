// MIT License - Copyright (c) 2026 Peter Wright

pub mod control;
pub mod surface;
pub mod transport;

pub use control::{ControlPlane, SessionToken};
pub use surface::MqttSurface;
pub use transport::{MqttInbound, MqttTransport, MqttTransportSettings, PublishRequest};

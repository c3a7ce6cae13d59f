// MIT License - Copyright (c) 2026 Peter Wright

/// Errors raised while dialing or speaking to the panel.
///
/// All of these are transient: the link logs them, backs off, and
/// reconnects. None of them ever terminates the process.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("dial failed: {0}")]
    DialFailed(#[source] std::io::Error),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("invalid panel host: {host}")]
    InvalidHost { host: String },

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(#[source] std::io::Error),

    #[error("frame of {size} bytes exceeds the frame size limit")]
    FrameTooLarge { size: usize },

    #[error("malformed frame: {details}")]
    MalformedFrame { details: String },

    #[error("read failed: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("connection closed by panel")]
    ReadEof,

    #[error("no frame received within the dead-man window")]
    DeadManExpired,
}

impl LinkError {
    /// Whether this failure should drop the connection (as opposed to
    /// discarding a single frame and keeping the link up).
    pub fn drops_connection(&self) -> bool {
        !matches!(self, LinkError::MalformedFrame { .. })
    }
}

/// Errors raised by the wire codec when a frame cannot be decoded at all.
///
/// Unknown tag values are NOT an error: they decode to
/// `InboundMessage::Unrecognized` and the state layer decides to drop them.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("field '{field}' is missing or has the wrong type")]
    BadField { field: &'static str },
}

/// Rejection reasons for control commands arriving over MQTT.
///
/// A rejected command is logged, counted, and never reaches the panel.
/// The MQTT caller is not notified (commands are fire-and-forget).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlReject {
    #[error("session token mismatch")]
    BadSessionToken,

    #[error("user code does not match")]
    BadCode,

    #[error("user code must be 4 or 6 digits")]
    BadCodeFormat,

    #[error("command requires a user code and none is available")]
    MissingCode,

    #[error("no partition known for entity '{entity}'")]
    UnknownPartition { entity: String },

    #[error("unknown control action '{action}'")]
    UnknownAction { action: String },

    #[error("control payload is not valid JSON")]
    BadPayload,
}

/// Configuration errors. Fatal at startup: printed and the process exits
/// with code 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field}: user code must be 4 or 6 digits")]
    BadUserCode { field: &'static str },

    #[error("ha_user_code requires panel_user_code to be set")]
    HaCodeWithoutPanelCode,

    #[error("cannot require codes for arm/trigger without panel_user_code")]
    CodeRequiredWithoutPanelCode,

    #[error(
        "invalid trigger command '{value}' (expected TRIGGER, TRIGGER_FIRE, TRIGGER_POLICE or TRIGGER_AUXILIARY)"
    )]
    BadTriggerCommand { value: String },

    #[error("mqtt_qos must be 0, 1 or 2 (got {value})")]
    BadQos { value: u8 },

    #[error("panel_unique_id must be non-empty and contain only [a-z0-9_]")]
    BadUniqueId,
}

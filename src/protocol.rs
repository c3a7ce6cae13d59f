// MIT License - Copyright (c) 2026 Peter Wright

//! Wire codec for the Control4 JSON dialect spoken by the panel.
//!
//! Pure translation between newline-delimited JSON frames and typed
//! records. No I/O, no timing: the transport layer owns the socket and the
//! state layer owns the semantics.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::devices::partition::{AlarmType, PartitionStatus};
use crate::devices::sensor::SensorStatus;
use crate::error::ProtocolError;

/// Literal `version` field on every outbound frame.
pub const WIRE_VERSION: &str = "0";
/// Literal `source` field on every outbound frame (Control4 dialect).
pub const WIRE_SOURCE: &str = "C4";

/// Placeholder used whenever a user code is rendered for logging.
pub const CODE_MASK: &str = "******";

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A zone as carried inside SUMMARY snapshots and ZONE_ADD/ZONE_UPDATE
/// events.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub zone_id: u32,
    pub partition_id: u32,
    pub name: String,
    pub zone_type: String,
    pub status: SensorStatus,
    pub battery_low: bool,
    pub tampered: bool,
}

/// A partition as carried inside SUMMARY snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionRecord {
    pub partition_id: u32,
    pub name: String,
    pub status: PartitionStatus,
    pub secure_arm: bool,
    pub zones: Vec<SensorRecord>,
}

/// A full INFO/SUMMARY snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SummaryInfo {
    pub software_version: Option<String>,
    pub partitions: Vec<PartitionRecord>,
}

/// Every inbound frame kind the bridge recognizes.
///
/// Unknown tag values decode to `Unrecognized` rather than an error; the
/// state layer logs and drops them. Routing precedence when several tag
/// fields are present: `event` wins over `info_type` wins over
/// `action_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Summary(SummaryInfo),
    ZoneActive { zone_id: u32, status: SensorStatus },
    ZoneUpdate { zone: SensorRecord },
    ZoneAdd { zone: SensorRecord },
    Arming { partition_id: u32, status: PartitionStatus, delay_secs: Option<u32> },
    Alarm { partition_id: u32, alarm_type: Option<AlarmType> },
    SecureArm { partition_id: u32, value: bool },
    Error { error_type: String, description: String, partition_id: Option<u32> },
    Ack,
    Unrecognized { raw: String },
}

/// Decode a single frame (one line, newline already stripped).
pub fn decode(frame: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value = serde_json::from_str(frame)?;
    let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;

    if let Some(event) = obj_str(obj, "event") {
        return decode_event(event, obj, frame);
    }
    if let Some(info_type) = obj_str(obj, "info_type") {
        return decode_info(info_type, obj, frame);
    }
    if obj_str(obj, "action_type").is_some() {
        // Panels echo action frames on some firmwares; nothing to apply.
        return Ok(InboundMessage::Unrecognized { raw: frame.to_string() });
    }

    Ok(InboundMessage::Unrecognized { raw: frame.to_string() })
}

fn decode_event(event: &str, obj: &Map<String, Value>, frame: &str) -> Result<InboundMessage, ProtocolError> {
    match event {
        "INFO" => match obj_str(obj, "info_type") {
            Some(info_type) => decode_info(info_type, obj, frame),
            None => Ok(InboundMessage::Unrecognized { raw: frame.to_string() }),
        },
        "ZONE_EVENT" => decode_zone_event(obj, frame),
        "ARMING" => {
            let partition_id = obj_u32(obj, "partition_id")
                .ok_or(ProtocolError::BadField { field: "partition_id" })?;
            let arming_type = obj_str(obj, "arming_type")
                .ok_or(ProtocolError::BadField { field: "arming_type" })?;
            match PartitionStatus::from_wire_str(arming_type) {
                Some(status) => Ok(InboundMessage::Arming {
                    partition_id,
                    status,
                    delay_secs: obj_u32(obj, "delay"),
                }),
                None => Ok(InboundMessage::Unrecognized { raw: frame.to_string() }),
            }
        }
        "ALARM" => {
            let partition_id = obj_u32(obj, "partition_id")
                .ok_or(ProtocolError::BadField { field: "partition_id" })?;
            let alarm_type = obj_str(obj, "alarm_type").and_then(AlarmType::from_wire_str);
            Ok(InboundMessage::Alarm { partition_id, alarm_type })
        }
        "SECURE_ARM" => decode_secure_arm(obj),
        "ERROR" => Ok(InboundMessage::Error {
            error_type: obj_str(obj, "error_type").unwrap_or("UNKNOWN").to_string(),
            description: obj_str(obj, "description").unwrap_or_default().to_string(),
            partition_id: obj_u32(obj, "partition_id"),
        }),
        "ACK" => Ok(InboundMessage::Ack),
        _ => Ok(InboundMessage::Unrecognized { raw: frame.to_string() }),
    }
}

fn decode_info(info_type: &str, obj: &Map<String, Value>, frame: &str) -> Result<InboundMessage, ProtocolError> {
    match info_type {
        "SUMMARY" => decode_summary(obj),
        // Some firmwares deliver secure_arm toggles as an INFO subtype
        // rather than a standalone event; both forms are accepted.
        "SECURE_ARM" => decode_secure_arm(obj),
        _ => Ok(InboundMessage::Unrecognized { raw: frame.to_string() }),
    }
}

fn decode_secure_arm(obj: &Map<String, Value>) -> Result<InboundMessage, ProtocolError> {
    let partition_id =
        obj_u32(obj, "partition_id").ok_or(ProtocolError::BadField { field: "partition_id" })?;
    let value = obj_bool(obj, "value").ok_or(ProtocolError::BadField { field: "value" })?;
    Ok(InboundMessage::SecureArm { partition_id, value })
}

fn decode_summary(obj: &Map<String, Value>) -> Result<InboundMessage, ProtocolError> {
    let list = obj
        .get("partition_list")
        .and_then(Value::as_array)
        .ok_or(ProtocolError::BadField { field: "partition_list" })?;

    let mut partitions = Vec::with_capacity(list.len());
    for entry in list {
        let part = entry.as_object().ok_or(ProtocolError::BadField { field: "partition_list" })?;
        let partition_id =
            obj_u32(part, "partition_id").ok_or(ProtocolError::BadField { field: "partition_id" })?;
        let status = obj_str(part, "status")
            .and_then(PartitionStatus::from_wire_str)
            .unwrap_or(PartitionStatus::Disarm);

        let mut zones = Vec::new();
        if let Some(zone_list) = part.get("zone_list").and_then(Value::as_array) {
            for zone in zone_list {
                let zone =
                    zone.as_object().ok_or(ProtocolError::BadField { field: "zone_list" })?;
                zones.push(decode_zone_record(zone, partition_id)?);
            }
        }

        partitions.push(PartitionRecord {
            partition_id,
            name: obj_str(part, "name").unwrap_or_default().to_string(),
            status,
            secure_arm: obj_bool(part, "secure_arm").unwrap_or(false),
            zones,
        });
    }

    Ok(InboundMessage::Summary(SummaryInfo {
        software_version: obj_str(obj, "version").map(str::to_string),
        partitions,
    }))
}

fn decode_zone_event(obj: &Map<String, Value>, frame: &str) -> Result<InboundMessage, ProtocolError> {
    let zone = obj
        .get("zone")
        .and_then(Value::as_object)
        .ok_or(ProtocolError::BadField { field: "zone" })?;

    match obj_str(obj, "zone_event_type") {
        Some("ZONE_ACTIVE") => {
            let zone_id =
                obj_u32(zone, "zone_id").ok_or(ProtocolError::BadField { field: "zone_id" })?;
            let status = obj_str(zone, "status")
                .and_then(SensorStatus::from_wire_str)
                .ok_or(ProtocolError::BadField { field: "status" })?;
            Ok(InboundMessage::ZoneActive { zone_id, status })
        }
        Some("ZONE_UPDATE") => Ok(InboundMessage::ZoneUpdate { zone: decode_zone_record(zone, 0)? }),
        Some("ZONE_ADD") => Ok(InboundMessage::ZoneAdd { zone: decode_zone_record(zone, 0)? }),
        _ => Ok(InboundMessage::Unrecognized { raw: frame.to_string() }),
    }
}

fn decode_zone_record(zone: &Map<String, Value>, default_partition: u32) -> Result<SensorRecord, ProtocolError> {
    Ok(SensorRecord {
        zone_id: obj_u32(zone, "zone_id").ok_or(ProtocolError::BadField { field: "zone_id" })?,
        partition_id: obj_u32(zone, "partition_id").unwrap_or(default_partition),
        name: obj_str(zone, "name").unwrap_or_default().to_string(),
        zone_type: obj_str(zone, "zone_type").unwrap_or_default().to_string(),
        status: obj_str(zone, "status")
            .and_then(SensorStatus::from_wire_str)
            .unwrap_or(SensorStatus::Closed),
        battery_low: obj_str(zone, "battery_status").is_some_and(|s| s.eq_ignore_ascii_case("low")),
        tampered: obj_bool(zone, "tampered").unwrap_or(false),
    })
}

impl InboundMessage {
    /// Re-encode a recognized inbound message to its wire JSON form.
    ///
    /// Returns `None` for `Unrecognized`. Field order follows the panel's
    /// canonical layout; comparisons should be value-based.
    pub fn to_wire_json(&self) -> Option<Value> {
        match self {
            InboundMessage::Summary(summary) => {
                let partitions: Vec<Value> = summary
                    .partitions
                    .iter()
                    .map(|p| {
                        json!({
                            "partition_id": p.partition_id,
                            "name": p.name,
                            "status": p.status.as_wire_str(),
                            "secure_arm": p.secure_arm,
                            "zone_list": p.zones.iter().map(zone_record_json).collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                let mut obj = json!({
                    "event": "INFO",
                    "info_type": "SUMMARY",
                    "partition_list": partitions,
                });
                if let Some(version) = &summary.software_version
                    && let Some(map) = obj.as_object_mut()
                {
                    map.insert("version".to_string(), json!(version));
                }
                Some(obj)
            }
            InboundMessage::ZoneActive { zone_id, status } => Some(json!({
                "event": "ZONE_EVENT",
                "zone_event_type": "ZONE_ACTIVE",
                "zone": { "zone_id": zone_id, "status": status.as_wire_str() },
            })),
            InboundMessage::ZoneUpdate { zone } => Some(json!({
                "event": "ZONE_EVENT",
                "zone_event_type": "ZONE_UPDATE",
                "zone": zone_record_json(zone),
            })),
            InboundMessage::ZoneAdd { zone } => Some(json!({
                "event": "ZONE_EVENT",
                "zone_event_type": "ZONE_ADD",
                "zone": zone_record_json(zone),
            })),
            InboundMessage::Arming { partition_id, status, delay_secs } => {
                let mut obj = json!({
                    "event": "ARMING",
                    "arming_type": status.as_wire_str(),
                    "partition_id": partition_id,
                });
                if let Some(delay) = delay_secs
                    && let Some(map) = obj.as_object_mut()
                {
                    map.insert("delay".to_string(), json!(delay));
                }
                Some(obj)
            }
            InboundMessage::Alarm { partition_id, alarm_type } => {
                let mut obj = json!({ "event": "ALARM", "partition_id": partition_id });
                if let Some(alarm_type) = alarm_type
                    && let Some(map) = obj.as_object_mut()
                {
                    map.insert("alarm_type".to_string(), json!(alarm_type.as_wire_str()));
                }
                Some(obj)
            }
            InboundMessage::SecureArm { partition_id, value } => Some(json!({
                "event": "SECURE_ARM",
                "partition_id": partition_id,
                "value": value,
            })),
            InboundMessage::Error { error_type, description, partition_id } => {
                let mut obj = json!({
                    "event": "ERROR",
                    "error_type": error_type,
                    "description": description,
                });
                if let Some(id) = partition_id
                    && let Some(map) = obj.as_object_mut()
                {
                    map.insert("partition_id".to_string(), json!(id));
                }
                Some(obj)
            }
            InboundMessage::Ack => Some(json!({ "event": "ACK" })),
            InboundMessage::Unrecognized { .. } => None,
        }
    }
}

fn zone_record_json(zone: &SensorRecord) -> Value {
    json!({
        "zone_id": zone.zone_id,
        "partition_id": zone.partition_id,
        "name": zone.name,
        "zone_type": zone.zone_type,
        "status": zone.status.as_wire_str(),
        "battery_status": if zone.battery_low { "Low" } else { "Normal" },
        "tampered": zone.tampered,
    })
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Arm mode for ARMING actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmType {
    Stay,
    Away,
}

impl ArmType {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Stay => "ARM_STAY",
            Self::Away => "ARM_AWAY",
        }
    }
}

/// Actions the bridge sends to the panel.
#[derive(Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Request a full INFO/SUMMARY snapshot. Doubles as the keep-alive
    /// probe.
    Info,
    Arm {
        partition_id: u32,
        arm_type: ArmType,
        user_code: Option<String>,
        exit_delay: Option<u32>,
        bypass: Option<bool>,
    },
    Disarm {
        partition_id: u32,
        user_code: String,
    },
    Trigger {
        partition_id: u32,
        alarm_type: AlarmType,
    },
}

impl OutboundAction {
    /// Whether this action is the keep-alive probe. The outbound buffer
    /// prefers dropping these when it overflows.
    pub fn is_keepalive(&self) -> bool {
        matches!(self, OutboundAction::Info)
    }
}

// User codes must never reach the log stream, so Debug is hand-written
// with the code masked.
impl fmt::Debug for OutboundAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundAction::Info => f.debug_struct("Info").finish(),
            OutboundAction::Arm { partition_id, arm_type, user_code, exit_delay, bypass } => f
                .debug_struct("Arm")
                .field("partition_id", partition_id)
                .field("arm_type", arm_type)
                .field("user_code", &user_code.as_ref().map(|_| CODE_MASK))
                .field("exit_delay", exit_delay)
                .field("bypass", bypass)
                .finish(),
            OutboundAction::Disarm { partition_id, .. } => f
                .debug_struct("Disarm")
                .field("partition_id", partition_id)
                .field("user_code", &CODE_MASK)
                .finish(),
            OutboundAction::Trigger { partition_id, alarm_type } => f
                .debug_struct("Trigger")
                .field("partition_id", partition_id)
                .field("alarm_type", alarm_type)
                .finish(),
        }
    }
}

/// The canonical outbound frame layout. serde serializes struct fields in
/// declaration order, which keeps emissions byte-stable for a given action.
#[derive(Serialize, Deserialize)]
struct WireAction {
    nonce: String,
    action: String,
    token: String,
    version: String,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arming_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alarm_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delay: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bypass: Option<bool>,
}

/// Encode an outbound action with the panel token and a fresh nonce.
pub fn encode(action: &OutboundAction, token: &str, nonce: &str) -> Result<String, ProtocolError> {
    let mut frame = WireAction {
        nonce: nonce.to_string(),
        action: String::new(),
        token: token.to_string(),
        version: WIRE_VERSION.to_string(),
        source: WIRE_SOURCE.to_string(),
        partition_id: None,
        arming_type: None,
        alarm_type: None,
        user_code: None,
        delay: None,
        bypass: None,
    };

    match action {
        OutboundAction::Info => {
            frame.action = "INFO".to_string();
        }
        OutboundAction::Arm { partition_id, arm_type, user_code, exit_delay, bypass } => {
            frame.action = "ARMING".to_string();
            frame.partition_id = Some(*partition_id);
            frame.arming_type = Some(arm_type.as_wire_str().to_string());
            frame.user_code = user_code.clone();
            frame.delay = *exit_delay;
            frame.bypass = *bypass;
        }
        OutboundAction::Disarm { partition_id, user_code } => {
            frame.action = "DISARM".to_string();
            frame.partition_id = Some(*partition_id);
            frame.user_code = Some(user_code.clone());
        }
        OutboundAction::Trigger { partition_id, alarm_type } => {
            frame.action = "TRIGGER".to_string();
            frame.partition_id = Some(*partition_id);
            frame.alarm_type = Some(alarm_type.as_wire_str().to_string());
        }
    }

    Ok(serde_json::to_string(&frame)?)
}

/// A decoded outbound frame: the action plus the additive token and nonce.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAction {
    pub action: OutboundAction,
    pub token: String,
    pub nonce: String,
}

/// Decode an outbound frame back into its action. The inverse of
/// [`encode`]; used to verify round-trips.
pub fn decode_action(frame: &str) -> Result<DecodedAction, ProtocolError> {
    let wire: WireAction = serde_json::from_str(frame)?;

    let action = match wire.action.as_str() {
        "INFO" => OutboundAction::Info,
        "ARMING" => {
            let arming_type = wire.arming_type.as_deref().unwrap_or_default();
            let arm_type = match arming_type {
                "ARM_STAY" => ArmType::Stay,
                "ARM_AWAY" => ArmType::Away,
                _ => return Err(ProtocolError::BadField { field: "arming_type" }),
            };
            OutboundAction::Arm {
                partition_id: wire.partition_id.ok_or(ProtocolError::BadField { field: "partition_id" })?,
                arm_type,
                user_code: wire.user_code,
                exit_delay: wire.delay,
                bypass: wire.bypass,
            }
        }
        "DISARM" => OutboundAction::Disarm {
            partition_id: wire.partition_id.ok_or(ProtocolError::BadField { field: "partition_id" })?,
            user_code: wire.user_code.ok_or(ProtocolError::BadField { field: "user_code" })?,
        },
        "TRIGGER" => OutboundAction::Trigger {
            partition_id: wire.partition_id.ok_or(ProtocolError::BadField { field: "partition_id" })?,
            alarm_type: wire
                .alarm_type
                .as_deref()
                .and_then(AlarmType::from_wire_str)
                .ok_or(ProtocolError::BadField { field: "alarm_type" })?,
        },
        _ => return Err(ProtocolError::BadField { field: "action" }),
    };

    Ok(DecodedAction { action, token: wire.token, nonce: wire.nonce })
}

// ---------------------------------------------------------------------------
// JSON field helpers: panel firmwares are loose about number-vs-string.
// ---------------------------------------------------------------------------

pub(crate) fn obj_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    obj.get(field).and_then(Value::as_str)
}

pub(crate) fn obj_u32(obj: &Map<String, Value>, field: &str) -> Option<u32> {
    match obj.get(field) {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn obj_bool(obj: &Map<String, Value>, field: &str) -> Option<bool> {
    match obj.get(field) {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

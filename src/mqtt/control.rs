// MIT License - Copyright (c) 2026 Peter Wright

//! Validates control commands from Home Assistant and turns them into
//! panel actions. Nothing unvalidated ever reaches the link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{is_valid_user_code, Config};
use crate::counters::Counters;
use crate::devices::partition::AlarmType;
use crate::error::ControlReject;
use crate::event::{Change, EntitySnapshot, ObserverReceiver, StateChange};
use crate::mqtt::surface::normalize_name_to_id;
use crate::mqtt::transport::MqttInbound;
use crate::protocol::{obj_bool, obj_str, obj_u32, ArmType, OutboundAction};
use crate::transport::LinkHandle;

/// Per-process control authentication token.
///
/// Embedded in discovery command templates so HA echoes it back with every
/// command; commands without it never reach the panel. Rotated whenever HA
/// restarts and discovery is replayed.
pub struct SessionToken {
    token: Mutex<String>,
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionToken {
    pub fn new() -> Self {
        Self { token: Mutex::new(uuid::Uuid::new_v4().to_string()) }
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current(&self) -> String {
        self.lock().clone()
    }

    /// Replace the token, invalidating every command template issued so
    /// far. Returns the new value.
    pub fn rotate(&self) -> String {
        let fresh = uuid::Uuid::new_v4().to_string();
        *self.lock() = fresh.clone();
        fresh
    }

    pub fn matches(&self, supplied: &str) -> bool {
        *self.lock() == supplied
    }
}

/// Which code-requirement knob applies to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodePolicy {
    Arm,
    Disarm,
    Trigger,
}

pub struct ControlPlane {
    cfg: Arc<Config>,
    session: Arc<SessionToken>,
    link: LinkHandle,
    counters: Arc<Counters>,
    /// entity_id (topic segment) → partition id, maintained from state
    /// observations so the `set` topic alone identifies the partition.
    entities: HashMap<String, u32>,
}

impl ControlPlane {
    pub fn new(
        cfg: Arc<Config>,
        session: Arc<SessionToken>,
        link: LinkHandle,
        counters: Arc<Counters>,
    ) -> Self {
        Self { cfg, session, link, counters, entities: HashMap::new() }
    }

    /// Consume control-topic messages and state changes until cancelled.
    /// Commands for the same partition are processed strictly in arrival
    /// order.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<MqttInbound>,
        mut changes: ObserverReceiver,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                change = changes.recv() => match change {
                    Some(change) => self.on_state_change(&change),
                    None => return,
                },
                msg = commands.recv() => match msg {
                    Some(msg) => self.on_command(msg),
                    None => return,
                },
            }
        }
    }

    fn on_state_change(&mut self, change: &StateChange) {
        if let EntitySnapshot::Partition(partition) = &change.entity {
            let relevant = matches!(change.change, Change::Created)
                || matches!(change.change, Change::AttributeChanged { field: "name", .. });
            if relevant {
                self.entities.insert(normalize_name_to_id(&partition.name), partition.id);
            }
        }
    }

    fn on_command(&mut self, msg: MqttInbound) {
        match self.handle_command(&msg) {
            Ok(action) => {
                info!("forwarding control command to panel: {action:?}");
                self.link.send(action);
            }
            Err(reject) => {
                match reject {
                    ControlReject::BadSessionToken => self.counters.record_rejected_session(),
                    ControlReject::BadCode
                    | ControlReject::BadCodeFormat
                    | ControlReject::MissingCode => self.counters.record_rejected_code(),
                    _ => {}
                }
                info!("rejected control command on {}: {reject}", msg.topic);
            }
        }
    }

    fn handle_command(&self, msg: &MqttInbound) -> Result<OutboundAction, ControlReject> {
        let value: Value = serde_json::from_str(&msg.payload).map_err(|e| {
            debug!("control payload is not JSON: {e}");
            ControlReject::BadPayload
        })?;
        let obj = value.as_object().ok_or(ControlReject::BadPayload)?;

        // Token first: an unauthenticated command gets no further analysis.
        let supplied_token = obj_str(obj, "session_token").unwrap_or_default();
        let token_ok = self.session.matches(supplied_token)
            || self
                .cfg
                .user_control_token
                .as_deref()
                .is_some_and(|t| t == supplied_token);
        if !token_ok {
            return Err(ControlReject::BadSessionToken);
        }

        let partition_id = self.resolve_partition(&msg.topic, obj)?;
        let action = obj_str(obj, "action").unwrap_or_default();
        let code = obj_str(obj, "code").filter(|c| !c.is_empty());

        match action {
            "ARM_STAY" | "ARM_HOME" => {
                let user_code = self.resolve_code(CodePolicy::Arm, code)?;
                Ok(OutboundAction::Arm {
                    partition_id,
                    arm_type: ArmType::Stay,
                    user_code,
                    exit_delay: obj_u32(obj, "exit_delay").or(self.cfg.arm_stay_exit_delay),
                    bypass: obj_bool(obj, "bypass").or(self.cfg.arm_stay_bypass),
                })
            }
            "ARM_AWAY" => {
                let user_code = self.resolve_code(CodePolicy::Arm, code)?;
                Ok(OutboundAction::Arm {
                    partition_id,
                    arm_type: ArmType::Away,
                    user_code,
                    exit_delay: obj_u32(obj, "exit_delay").or(self.cfg.arm_away_exit_delay),
                    bypass: obj_bool(obj, "bypass").or(self.cfg.arm_away_bypass),
                })
            }
            "DISARM" => {
                let user_code = self
                    .resolve_code(CodePolicy::Disarm, code)?
                    .ok_or(ControlReject::MissingCode)?;
                Ok(OutboundAction::Disarm { partition_id, user_code })
            }
            "TRIGGER" => {
                self.resolve_code(CodePolicy::Trigger, code)?;
                Ok(OutboundAction::Trigger {
                    partition_id,
                    alarm_type: self.cfg.default_trigger_alarm_type(),
                })
            }
            "TRIGGER_POLICE" | "TRIGGER_FIRE" | "TRIGGER_AUXILIARY" => {
                self.resolve_code(CodePolicy::Trigger, code)?;
                let alarm_type = match action {
                    "TRIGGER_FIRE" => AlarmType::Fire,
                    "TRIGGER_AUXILIARY" => AlarmType::Auxiliary,
                    _ => AlarmType::Police,
                };
                Ok(OutboundAction::Trigger { partition_id, alarm_type })
            }
            other => Err(ControlReject::UnknownAction { action: other.to_string() }),
        }
    }

    /// The partition is identified by the `set` topic's entity segment;
    /// the payload's partition_id (from the command template) is accepted
    /// as a fallback and cross-checked when both are present.
    fn resolve_partition(&self, topic: &str, obj: &serde_json::Map<String, Value>) -> Result<u32, ControlReject> {
        let entity = topic.rsplit('/').nth(1).unwrap_or_default();
        let from_topic = self.entities.get(entity).copied();
        let from_payload = obj_u32(obj, "partition_id");

        match (from_topic, from_payload) {
            (Some(topic_id), Some(payload_id)) if topic_id != payload_id => {
                warn!(
                    "partition mismatch for '{entity}': topic says {topic_id}, payload says {payload_id}"
                );
                Ok(topic_id)
            }
            (Some(id), _) => Ok(id),
            (None, Some(id)) => Ok(id),
            (None, None) => Err(ControlReject::UnknownPartition { entity: entity.to_string() }),
        }
    }

    fn code_required(&self, policy: CodePolicy) -> bool {
        match policy {
            CodePolicy::Arm => self.cfg.ha_code_arm_required,
            CodePolicy::Disarm => self.cfg.ha_code_disarm_required,
            CodePolicy::Trigger => self.cfg.ha_code_trigger_required,
        }
    }

    /// The user-code decision table. Returns the code to forward to the
    /// panel, if any.
    fn resolve_code(
        &self,
        policy: CodePolicy,
        supplied: Option<&str>,
    ) -> Result<Option<String>, ControlReject> {
        if let Some(code) = supplied
            && !is_valid_user_code(code)
        {
            return Err(ControlReject::BadCodeFormat);
        }

        if !self.code_required(policy) {
            // No code demanded of the HA user; still verify one if it was
            // sent and we are the checking side, then fall back to the
            // stored panel code.
            if self.cfg.ha_check_user_code
                && let Some(code) = supplied
            {
                let expected = self.cfg.ha_user_code.as_ref().or(self.cfg.panel_user_code.as_ref());
                if expected.is_some_and(|e| e != code) {
                    return Err(ControlReject::BadCode);
                }
            }
            return Ok(self.cfg.panel_user_code.clone());
        }

        if self.cfg.ha_check_user_code {
            let supplied = supplied.ok_or(ControlReject::MissingCode)?;
            let expected = self
                .cfg
                .ha_user_code
                .as_ref()
                .or(self.cfg.panel_user_code.as_ref())
                .ok_or(ControlReject::MissingCode)?;
            if supplied != expected {
                return Err(ControlReject::BadCode);
            }
            // The panel only ever sees its own code.
            Ok(self.cfg.panel_user_code.clone())
        } else {
            // The panel is the validator; forward what HA sent, verbatim.
            let supplied = supplied.ok_or(ControlReject::MissingCode)?;
            Ok(Some(supplied.to_string()))
        }
    }
}

// MIT License - Copyright (c) 2026 Peter Wright

//! Mirrors the domain model onto MQTT with Home Assistant discovery
//! semantics: retained discovery configs, state topics, availability, and
//! full rediscovery when HA or the broker restarts.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::devices::partition::Partition;
use crate::devices::sensor::Sensor;
use crate::devices::PanelMeta;
use crate::event::{Change, EntitySnapshot, ObserverReceiver, StateChange};
use crate::mqtt::control::SessionToken;
use crate::mqtt::transport::{MqttInbound, PublishRequest};

/// HA-restart rediscovery is debounced to at most once per this window.
const REDISCOVERY_DEBOUNCE: Duration = Duration::from_secs(5);

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const SENSOR_PAYLOAD_ON: &str = "ON";
const SENSOR_PAYLOAD_OFF: &str = "OFF";

/// Normalize an entity name into a topic-safe id: lowercase ASCII
/// alphanumerics, everything else folded to `_`.
pub fn normalize_name_to_id(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub struct MqttSurface {
    cfg: Arc<Config>,
    session: Arc<SessionToken>,
    publish_tx: mpsc::UnboundedSender<PublishRequest>,
    // Cached snapshots so rediscovery can replay every entity.
    meta: PanelMeta,
    partitions: BTreeMap<u32, Partition>,
    pending_rediscovery: Option<Instant>,
    last_rediscovery: Option<Instant>,
}

impl MqttSurface {
    pub fn new(
        cfg: Arc<Config>,
        session: Arc<SessionToken>,
        publish_tx: mpsc::UnboundedSender<PublishRequest>,
    ) -> Self {
        Self {
            cfg,
            session,
            publish_tx,
            meta: PanelMeta::default(),
            partitions: BTreeMap::new(),
            pending_rediscovery: None,
            last_rediscovery: None,
        }
    }

    /// Consume state changes, broker reconnect pings, and HA status
    /// messages until cancelled.
    pub async fn run(
        mut self,
        mut changes: ObserverReceiver,
        mut reconnect: mpsc::UnboundedReceiver<()>,
        mut ha_status: mpsc::UnboundedReceiver<MqttInbound>,
        cancel: CancellationToken,
    ) {
        loop {
            let pending = self.pending_rediscovery;
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.publish_all_unavailable();
                    return;
                }
                change = changes.recv() => match change {
                    Some(change) => self.on_change(change),
                    None => return,
                },
                ping = reconnect.recv() => match ping {
                    Some(()) => {
                        // The broker may have restarted without persistence;
                        // replay discovery right away.
                        debug!("broker (re)connected, replaying discovery");
                        self.rediscover();
                    }
                    None => return,
                },
                msg = ha_status.recv() => match msg {
                    Some(msg) => {
                        if msg.payload == self.cfg.ha_status_online_payload {
                            info!("Home Assistant restarted, scheduling rediscovery");
                            self.schedule_rediscovery();
                        }
                    }
                    None => return,
                },
                _ = sleep_until(pending.unwrap_or_else(Instant::now)), if pending.is_some() => {
                    self.pending_rediscovery = None;
                    // A rediscovery triggered by HA restart rotates the
                    // session token so stale command templates die with it.
                    self.session.rotate();
                    self.rediscover();
                }
            }
        }
    }

    fn schedule_rediscovery(&mut self) {
        if self.pending_rediscovery.is_some() {
            return;
        }
        let now = Instant::now();
        let earliest = match self.last_rediscovery {
            Some(last) => (last + REDISCOVERY_DEBOUNCE).max(now),
            None => now,
        };
        self.pending_rediscovery = Some(earliest);
    }

    /// Republish discovery, availability, state, and attributes for every
    /// known entity.
    fn rediscover(&mut self) {
        self.last_rediscovery = Some(Instant::now());
        self.publish_last_error_entity();

        let partitions: Vec<Partition> = self.partitions.values().cloned().collect();
        for partition in &partitions {
            self.publish_partition_full(partition);
            for sensor in partition.sensors.values() {
                self.publish_sensor_full(sensor);
            }
        }
    }

    fn on_change(&mut self, change: StateChange) {
        match &change.entity {
            EntitySnapshot::Panel(meta) => {
                let software_changed = meta.software_version != self.meta.software_version;
                self.meta = meta.clone();
                match &change.change {
                    Change::AttributeChanged { field: "last_error", .. } => {
                        self.publish_last_error_state();
                    }
                    _ if software_changed => {
                        // The device block embeds sw_version; refresh every
                        // discovery config that references it.
                        self.rediscover();
                    }
                    _ => {}
                }
            }
            EntitySnapshot::Partition(partition) => {
                let partition = partition.clone();
                self.partitions.insert(partition.id, partition.clone());
                self.on_partition_change(&partition, &change.change);
            }
            EntitySnapshot::Sensor(sensor) => {
                let sensor = sensor.clone();
                self.cache_sensor(&sensor);
                self.on_sensor_change(&sensor, &change.change);
            }
        }
    }

    fn cache_sensor(&mut self, sensor: &Sensor) {
        for (id, partition) in self.partitions.iter_mut() {
            if *id != sensor.partition_id {
                partition.sensors.remove(&sensor.id);
            }
        }
        match self.partitions.get_mut(&sensor.partition_id) {
            Some(partition) => {
                partition.sensors.insert(sensor.id, sensor.clone());
            }
            None => warn!(
                "sensor {} refers to unknown partition {}",
                sensor.id, sensor.partition_id
            ),
        }
    }

    fn on_partition_change(&mut self, partition: &Partition, change: &Change) {
        match change {
            Change::Created => self.publish_partition_full(partition),
            Change::AttributeChanged { field, .. } => match *field {
                "status" => self.publish_partition_state(partition),
                // Discovery embeds the name and the secure_arm-derived
                // code requirements.
                "name" | "secure_arm" => {
                    self.publish_partition_discovery(partition);
                    self.publish_partition_state(partition);
                    self.publish_partition_attributes(partition);
                }
                "alarm_type" | "last_error" => self.publish_partition_attributes(partition),
                other => debug!("no publish rule for partition attribute '{other}'"),
            },
            Change::WentOffline => self.emit_raw(
                self.partition_topic(partition, "availability"),
                PAYLOAD_OFFLINE.to_string(),
            ),
            Change::CameOnline => self.emit_raw(
                self.partition_topic(partition, "availability"),
                PAYLOAD_ONLINE.to_string(),
            ),
        }
    }

    fn on_sensor_change(&mut self, sensor: &Sensor, change: &Change) {
        match change {
            Change::Created => self.publish_sensor_full(sensor),
            Change::AttributeChanged { field, .. } => match *field {
                "status" => self.publish_sensor_state(sensor),
                "name" | "zone_type" => {
                    self.publish_sensor_discovery(sensor);
                    self.publish_sensor_state(sensor);
                    self.publish_sensor_attributes(sensor);
                }
                "battery_low" | "tampered" | "partition_id" => {
                    self.publish_sensor_attributes(sensor)
                }
                other => debug!("no publish rule for sensor attribute '{other}'"),
            },
            Change::WentOffline => self.emit_raw(
                self.sensor_topic(sensor, "availability"),
                PAYLOAD_OFFLINE.to_string(),
            ),
            Change::CameOnline => self.emit_raw(
                self.sensor_topic(sensor, "availability"),
                PAYLOAD_ONLINE.to_string(),
            ),
        }
    }

    fn publish_all_unavailable(&self) {
        let partitions: Vec<Partition> = self.partitions.values().cloned().collect();
        for partition in &partitions {
            self.emit_raw(self.partition_topic(partition, "availability"), PAYLOAD_OFFLINE.to_string());
            for sensor in partition.sensors.values() {
                self.emit_raw(self.sensor_topic(sensor, "availability"), PAYLOAD_OFFLINE.to_string());
            }
        }
    }

    // -- Topics ------------------------------------------------------------

    fn partition_topic(&self, partition: &Partition, leaf: &str) -> String {
        format!(
            "{}/alarm_control_panel/{}/{}/{}",
            self.cfg.ha_discovery_prefix,
            self.cfg.panel_unique_id,
            normalize_name_to_id(&partition.name),
            leaf
        )
    }

    fn sensor_topic(&self, sensor: &Sensor, leaf: &str) -> String {
        format!(
            "{}/binary_sensor/{}/{}/{}",
            self.cfg.ha_discovery_prefix,
            self.cfg.panel_unique_id,
            normalize_name_to_id(&sensor.name),
            leaf
        )
    }

    fn last_error_topic(&self, leaf: &str) -> String {
        format!(
            "{}/sensor/{}/last_error/{}",
            self.cfg.ha_discovery_prefix, self.cfg.panel_unique_id, leaf
        )
    }

    // -- Payloads ----------------------------------------------------------

    fn device_json(&self) -> Value {
        let mut device = json!({
            "name": self.cfg.panel_device_name,
            "identifiers": [self.cfg.panel_unique_id],
            "manufacturer": "Qolsys",
            "model": "IQ Panel 2+",
        });
        if let Some(version) = &self.meta.software_version {
            device["sw_version"] = json!(version);
        }
        if let Some(mac) = &self.cfg.panel_mac {
            device["connections"] = json!([["mac", mac]]);
        }
        device
    }

    fn availability_json(&self, entity_topic: &str) -> Value {
        json!([
            {
                "topic": self.cfg.instance_availability_topic(),
                "payload_available": PAYLOAD_ONLINE,
                "payload_not_available": PAYLOAD_OFFLINE,
            },
            {
                "topic": entity_topic,
                "payload_available": PAYLOAD_ONLINE,
                "payload_not_available": PAYLOAD_OFFLINE,
            },
        ])
    }

    fn command_template_json(&self, partition: &Partition) -> String {
        let mut template = serde_json::Map::new();
        template.insert("partition_id".to_string(), json!(partition.id.to_string()));
        template.insert("action".to_string(), json!("{{ action }}"));
        template.insert("session_token".to_string(), json!(self.session.current()));
        let any_code_required = self.cfg.ha_code_arm_required
            || self.cfg.ha_code_disarm_required
            || self.cfg.ha_code_trigger_required;
        if any_code_required && !self.cfg.ha_check_user_code {
            // The only configuration where the code must transit MQTT on
            // every command; everywhere else the session token is enough.
            template.insert("code".to_string(), json!("{{ code }}"));
        }
        Value::Object(template).to_string()
    }

    fn partition_discovery_json(&self, partition: &Partition) -> Value {
        // A secure-arm partition with no stored panel code needs HA to
        // prompt for one.
        let secure_arm_code = partition.secure_arm && self.cfg.panel_user_code.is_none();

        let mut payload = json!({
            "name": partition.name,
            "state_topic": self.partition_topic(partition, "state"),
            "command_topic": self.partition_topic(partition, "set"),
            "command_template": self.command_template_json(partition),
            "code_arm_required": self.cfg.ha_code_arm_required || secure_arm_code,
            "code_disarm_required": self.cfg.ha_code_disarm_required,
            "code_trigger_required": self.cfg.ha_code_trigger_required || secure_arm_code,
            "supported_features": ["arm_home", "arm_away", "trigger"],
            "availability_mode": "all",
            "availability": self.availability_json(&self.partition_topic(partition, "availability")),
            "json_attributes_topic": self.partition_topic(partition, "attributes"),
            "unique_id": format!("{}_p{}", self.cfg.panel_unique_id, partition.id),
            "device": self.device_json(),
        });

        if let Some(cmd) = &self.cfg.trigger_default_command {
            payload["payload_trigger"] = json!(cmd);
        }

        if self.cfg.ha_code_arm_required || self.cfg.ha_code_disarm_required {
            let code = self.cfg.ha_user_code.as_ref().or(self.cfg.panel_user_code.as_ref());
            if self.cfg.ha_check_user_code {
                if let Some(code) = code {
                    payload["code"] = json!(code);
                }
            } else if code.is_none_or(|c| c.chars().all(|ch| ch.is_ascii_digit())) {
                payload["code"] = json!("REMOTE_CODE");
            } else {
                payload["code"] = json!("REMOTE_CODE_TEXT");
            }
        }

        payload
    }

    fn sensor_discovery_json(&self, sensor: &Sensor) -> Value {
        let device_class = sensor
            .class
            .ha_device_class()
            .unwrap_or(self.cfg.sensor_default_device_class.as_str());
        json!({
            "name": sensor.name,
            "device_class": device_class,
            "state_topic": self.sensor_topic(sensor, "state"),
            "payload_on": SENSOR_PAYLOAD_ON,
            "payload_off": SENSOR_PAYLOAD_OFF,
            "availability_mode": "all",
            "availability": self.availability_json(&self.sensor_topic(sensor, "availability")),
            "json_attributes_topic": self.sensor_topic(sensor, "attributes"),
            "unique_id": format!("{}_s{}", self.cfg.panel_unique_id, sensor.id),
            "device": self.device_json(),
        })
    }

    // -- Publishing --------------------------------------------------------

    fn emit(&self, topic: String, payload: &Value) {
        self.emit_raw(topic, payload.to_string());
    }

    fn emit_raw(&self, topic: String, payload: String) {
        let retain = self.cfg.mqtt_retain;
        if self.publish_tx.send(PublishRequest { topic, payload, retain }).is_err() {
            error!("publish channel closed, dropping message");
        }
    }

    /// Discovery, then availability, then state, then attributes. HA needs
    /// the config before it will accept the rest.
    fn publish_partition_full(&self, partition: &Partition) {
        self.publish_partition_discovery(partition);
        let availability = if partition.available { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        self.emit_raw(self.partition_topic(partition, "availability"), availability.to_string());
        self.publish_partition_state(partition);
        self.publish_partition_attributes(partition);
    }

    fn publish_partition_discovery(&self, partition: &Partition) {
        self.emit(self.partition_topic(partition, "config"), &self.partition_discovery_json(partition));
    }

    fn publish_partition_state(&self, partition: &Partition) {
        self.emit_raw(
            self.partition_topic(partition, "state"),
            partition.status.ha_state().to_string(),
        );
    }

    fn publish_partition_attributes(&self, partition: &Partition) {
        let attributes = json!({
            "secure_arm": partition.secure_arm,
            "alarm_type": partition.alarm_type.map(|t| t.as_wire_str()),
            "last_error_type": partition.last_error_type,
            "last_error_desc": partition.last_error_desc,
            "last_error_at": partition.last_error_at.map(|t| t.to_rfc3339()),
        });
        self.emit(self.partition_topic(partition, "attributes"), &attributes);
    }

    fn publish_sensor_full(&self, sensor: &Sensor) {
        self.publish_sensor_discovery(sensor);
        let availability = if sensor.available { PAYLOAD_ONLINE } else { PAYLOAD_OFFLINE };
        self.emit_raw(self.sensor_topic(sensor, "availability"), availability.to_string());
        self.publish_sensor_state(sensor);
        self.publish_sensor_attributes(sensor);
    }

    fn publish_sensor_discovery(&self, sensor: &Sensor) {
        self.emit(self.sensor_topic(sensor, "config"), &self.sensor_discovery_json(sensor));
    }

    fn publish_sensor_state(&self, sensor: &Sensor) {
        let payload = if sensor.status.is_triggered() { SENSOR_PAYLOAD_ON } else { SENSOR_PAYLOAD_OFF };
        self.emit_raw(self.sensor_topic(sensor, "state"), payload.to_string());
    }

    fn publish_sensor_attributes(&self, sensor: &Sensor) {
        let attributes = json!({
            "zone_type": sensor.zone_type,
            "battery_low": sensor.battery_low,
            "tampered": sensor.tampered,
            "last_seen": sensor.last_seen.map(|t| t.to_rfc3339()),
        });
        self.emit(self.sensor_topic(sensor, "attributes"), &attributes);
    }

    fn publish_last_error_entity(&self) {
        let payload = json!({
            "name": "Last Error",
            "device_class": "timestamp",
            "state_topic": self.last_error_topic("state"),
            "availability_mode": "all",
            "availability": [{
                "topic": self.cfg.instance_availability_topic(),
                "payload_available": PAYLOAD_ONLINE,
                "payload_not_available": PAYLOAD_OFFLINE,
            }],
            "json_attributes_topic": self.last_error_topic("attributes"),
            "unique_id": format!("{}_last_error", self.cfg.panel_unique_id),
            "device": self.device_json(),
        });
        self.emit(self.last_error_topic("config"), &payload);
        self.publish_last_error_state();
    }

    fn publish_last_error_state(&self) {
        let state = self
            .meta
            .last_error
            .as_ref()
            .map(|e| e.at.to_rfc3339())
            .unwrap_or_default();
        self.emit_raw(self.last_error_topic("state"), state);

        let attributes = match &self.meta.last_error {
            Some(e) => json!({ "type": e.error_type, "desc": e.description }),
            None => json!({ "type": null, "desc": null }),
        };
        self.emit(self.last_error_topic("attributes"), &attributes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::partition::{AlarmType, PartitionStatus};
    use crate::devices::sensor::SensorStatus;

    fn test_config(extra: &[&str]) -> Arc<Config> {
        use clap::Parser;
        let mut args = vec![
            "qolsys2mqtt",
            "--panel-host",
            "192.0.2.10",
            "--panel-token",
            "T",
            "--mqtt-host",
            "192.0.2.20",
        ];
        args.extend_from_slice(extra);
        let mut config = Config::try_parse_from(args).expect("config should parse");
        config.validate().expect("config should validate");
        Arc::new(config)
    }

    fn test_surface(extra: &[&str]) -> (MqttSurface, mpsc::UnboundedReceiver<PublishRequest>) {
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let surface = MqttSurface::new(test_config(extra), Arc::new(SessionToken::new()), publish_tx);
        (surface, publish_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PublishRequest>) -> Vec<PublishRequest> {
        let mut out = Vec::new();
        while let Ok(req) = rx.try_recv() {
            out.push(req);
        }
        out
    }

    fn home_partition() -> Partition {
        let mut partition = Partition::new(0, "home");
        partition.status = PartitionStatus::Disarm;
        partition
    }

    fn front_door() -> Sensor {
        Sensor::new(1, 0, "Front Door", "DoorWindow")
    }

    #[test]
    fn normalize_names() {
        assert_eq!(normalize_name_to_id("Front Door"), "front_door");
        assert_eq!(normalize_name_to_id("home"), "home");
        assert_eq!(normalize_name_to_id("Zone #3 (back)"), "zone__3__back_");
    }

    #[test]
    fn partition_created_publishes_discovery_availability_state_in_order() {
        let (mut surface, mut rx) = test_surface(&[]);
        surface.on_change(StateChange {
            entity: EntitySnapshot::Partition(home_partition()),
            change: Change::Created,
        });

        let published = drain(&mut rx);
        assert_eq!(published.len(), 4);
        assert_eq!(published[0].topic, "homeassistant/alarm_control_panel/qolsys_panel/home/config");
        assert_eq!(
            published[1].topic,
            "homeassistant/alarm_control_panel/qolsys_panel/home/availability"
        );
        assert_eq!(published[1].payload, "online");
        assert_eq!(published[2].topic, "homeassistant/alarm_control_panel/qolsys_panel/home/state");
        assert_eq!(published[2].payload, "disarmed");
        assert_eq!(
            published[3].topic,
            "homeassistant/alarm_control_panel/qolsys_panel/home/attributes"
        );
        assert!(published.iter().all(|p| p.retain));
    }

    #[test]
    fn partition_discovery_payload_shape() {
        let (mut surface, mut rx) = test_surface(&[
            "--panel-user-code",
            "1234",
            "--ha-code-arm-required",
            "true",
            "--trigger-default-command",
            "TRIGGER_POLICE",
        ]);
        surface.on_change(StateChange {
            entity: EntitySnapshot::Partition(home_partition()),
            change: Change::Created,
        });

        let published = drain(&mut rx);
        let config: Value = serde_json::from_str(&published[0].payload).unwrap();
        assert_eq!(config["name"], "home");
        assert_eq!(config["unique_id"], "qolsys_panel_p0");
        assert_eq!(config["code_arm_required"], true);
        assert_eq!(config["code_disarm_required"], false);
        assert_eq!(config["payload_trigger"], "TRIGGER_POLICE");
        assert_eq!(config["device"]["identifiers"][0], "qolsys_panel");
        assert_eq!(config["code"], "1234");
        assert_eq!(
            config["command_topic"],
            "homeassistant/alarm_control_panel/qolsys_panel/home/set"
        );

        // The command template carries the partition id and session token.
        let template: Value =
            serde_json::from_str(config["command_template"].as_str().unwrap()).unwrap();
        assert_eq!(template["partition_id"], "0");
        assert_eq!(template["action"], "{{ action }}");
        assert!(template["session_token"].as_str().is_some_and(|s| !s.is_empty()));
        assert!(template.get("code").is_none(), "code placeholder only when HA does not check");
    }

    #[test]
    fn command_template_includes_code_when_not_checked_locally() {
        let (mut surface, mut rx) = test_surface(&[
            "--panel-user-code",
            "1234",
            "--ha-code-disarm-required",
            "true",
            "--ha-check-user-code",
            "false",
        ]);
        surface.on_change(StateChange {
            entity: EntitySnapshot::Partition(home_partition()),
            change: Change::Created,
        });

        let published = drain(&mut rx);
        let config: Value = serde_json::from_str(&published[0].payload).unwrap();
        let template: Value =
            serde_json::from_str(config["command_template"].as_str().unwrap()).unwrap();
        assert_eq!(template["code"], "{{ code }}");
        assert_eq!(config["code"], "REMOTE_CODE");
    }

    #[test]
    fn sensor_created_publishes_device_class() {
        let (mut surface, mut rx) = test_surface(&[]);
        surface.partitions.insert(0, home_partition());
        surface.on_change(StateChange {
            entity: EntitySnapshot::Sensor(front_door()),
            change: Change::Created,
        });

        let published = drain(&mut rx);
        assert_eq!(published[0].topic, "homeassistant/binary_sensor/qolsys_panel/front_door/config");
        let config: Value = serde_json::from_str(&published[0].payload).unwrap();
        assert_eq!(config["device_class"], "door");
        assert_eq!(config["payload_on"], "ON");
        assert_eq!(config["payload_off"], "OFF");
        assert_eq!(config["unique_id"], "qolsys_panel_s1");
    }

    #[test]
    fn unknown_sensor_class_uses_default_device_class() {
        let (mut surface, mut rx) = test_surface(&[]);
        surface.partitions.insert(0, home_partition());
        let sensor = Sensor::new(9, 0, "Weird Thing", "SomethingNew");
        surface.on_change(StateChange { entity: EntitySnapshot::Sensor(sensor), change: Change::Created });

        let published = drain(&mut rx);
        let config: Value = serde_json::from_str(&published[0].payload).unwrap();
        assert_eq!(config["device_class"], "safety");
    }

    #[test]
    fn status_change_publishes_state_only() {
        let (mut surface, mut rx) = test_surface(&[]);
        surface.partitions.insert(0, home_partition());
        let mut sensor = front_door();
        surface.cache_sensor(&sensor);
        drain(&mut rx);

        sensor.status = SensorStatus::Open;
        surface.on_change(StateChange {
            entity: EntitySnapshot::Sensor(sensor),
            change: Change::AttributeChanged {
                field: "status",
                old: "Closed".to_string(),
                new: "Open".to_string(),
            },
        });

        let published = drain(&mut rx);
        assert_eq!(published.len(), 1, "zone open must publish exactly the state topic");
        assert_eq!(published[0].topic, "homeassistant/binary_sensor/qolsys_panel/front_door/state");
        assert_eq!(published[0].payload, "ON");
    }

    #[test]
    fn partition_state_strings() {
        let (mut surface, mut rx) = test_surface(&[]);
        let mut partition = home_partition();
        surface.partitions.insert(0, partition.clone());

        for (status, expected) in [
            (PartitionStatus::ExitDelay, "arming"),
            (PartitionStatus::ArmAway, "armed_away"),
            (PartitionStatus::Alarm, "triggered"),
        ] {
            partition.status = status;
            if status == PartitionStatus::Alarm {
                partition.alarm_type = Some(AlarmType::Police);
            }
            surface.on_change(StateChange {
                entity: EntitySnapshot::Partition(partition.clone()),
                change: Change::AttributeChanged {
                    field: "status",
                    old: String::new(),
                    new: status.as_wire_str().to_string(),
                },
            });
            let published = drain(&mut rx);
            assert_eq!(published.len(), 1);
            assert_eq!(published[0].payload, expected);
        }
    }

    #[test]
    fn went_offline_publishes_availability_only() {
        let (mut surface, mut rx) = test_surface(&[]);
        let mut partition = home_partition();
        partition.available = false;
        surface.on_change(StateChange {
            entity: EntitySnapshot::Partition(partition),
            change: Change::WentOffline,
        });

        let published = drain(&mut rx);
        assert_eq!(published.len(), 1);
        assert!(published[0].topic.ends_with("/availability"));
        assert_eq!(published[0].payload, "offline");
    }

    #[test]
    fn secure_arm_change_republishes_discovery_then_state() {
        let (mut surface, mut rx) = test_surface(&[]);
        let mut partition = home_partition();
        surface.partitions.insert(0, partition.clone());
        drain(&mut rx);

        partition.secure_arm = true;
        surface.on_change(StateChange {
            entity: EntitySnapshot::Partition(partition),
            change: Change::AttributeChanged {
                field: "secure_arm",
                old: "false".to_string(),
                new: "true".to_string(),
            },
        });

        let published = drain(&mut rx);
        assert!(published[0].topic.ends_with("/config"));
        assert!(published[1].topic.ends_with("/state"));
        // secure_arm without a panel code forces code_arm_required.
        let config: Value = serde_json::from_str(&published[0].payload).unwrap();
        assert_eq!(config["code_arm_required"], true);
    }

    #[test]
    fn rediscover_replays_every_entity() {
        let (mut surface, mut rx) = test_surface(&[]);
        let mut partition = home_partition();
        partition.sensors.insert(1, front_door());
        surface.partitions.insert(0, partition);

        surface.rediscover();
        let published = drain(&mut rx);
        let configs: Vec<_> = published.iter().filter(|p| p.topic.ends_with("/config")).collect();
        assert_eq!(configs.len(), 3, "last_error + partition + sensor discovery");
        assert!(published.iter().any(|p| p.topic.ends_with("/home/state")));
        assert!(published.iter().any(|p| p.topic.ends_with("/front_door/state")));
    }

    #[tokio::test(start_paused = true)]
    async fn ha_restart_rediscovery_is_debounced_and_rotates_token() {
        let (surface, mut rx) = test_surface(&[]);
        let session = surface.session.clone();
        let token_before = session.current();

        let (_changes_tx, changes_rx) = crate::event::observer_channel();
        let (_reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let (ha_tx, ha_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(surface.run(changes_rx, reconnect_rx, ha_rx, cancel.clone()));

        // Two HA online payloads in quick succession.
        for _ in 0..2 {
            ha_tx.send(MqttInbound {
                topic: "homeassistant/status".to_string(),
                payload: "online".to_string(),
            })
            .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(3)).await;

        cancel.cancel();
        task.await.unwrap();

        let published = drain(&mut rx);
        let configs = published.iter().filter(|p| p.topic.ends_with("/config")).count();
        assert_eq!(configs, 1, "two HA restarts within the window must rediscover once");
        assert_ne!(session.current(), token_before, "HA restart must rotate the session token");
    }
}

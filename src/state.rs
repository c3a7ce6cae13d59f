// MIT License - Copyright (c) 2026 Peter Wright

//! The authoritative panel model: partitions and sensors, mutated only by
//! the task that consumes the panel link, observed by everyone else.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::counters::Counters;
use crate::devices::partition::{AlarmType, Partition, PartitionStatus};
use crate::devices::sensor::{Sensor, SensorClass, SensorStatus};
use crate::devices::{PanelError, PanelMeta};
use crate::event::{Change, EntitySnapshot, ObserverSender, StateChange};
use crate::protocol::{self, InboundMessage, PartitionRecord, SensorRecord, SummaryInfo};

/// The observable domain model.
///
/// `apply` is a single synchronous critical section: observers are
/// notified after all mutations for a frame have landed, with snapshots
/// taken from the already-consistent state. Notification order within one
/// frame is fixed: panel-level changes, then each partition, then that
/// partition's sensors.
pub struct PanelState {
    meta: PanelMeta,
    partitions: BTreeMap<u32, Partition>,
    observers: Vec<ObserverSender>,
    acks: u64,
}

impl Default for PanelState {
    fn default() -> Self {
        Self::new()
    }
}

impl PanelState {
    pub fn new() -> Self {
        Self { meta: PanelMeta::default(), partitions: BTreeMap::new(), observers: Vec::new(), acks: 0 }
    }

    /// Register an observer. Changes are pushed in apply-order; observers
    /// that need to react asynchronously drain their channel from their own
    /// task.
    pub fn register_observer(&mut self, tx: ObserverSender) {
        self.observers.push(tx);
    }

    pub fn meta(&self) -> &PanelMeta {
        &self.meta
    }

    pub fn partition(&self, id: u32) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    /// Find a sensor by id, whichever partition currently holds it.
    pub fn sensor(&self, id: u32) -> Option<&Sensor> {
        self.partitions.values().find_map(|p| p.sensor(id))
    }

    /// Consume the panel link inbound stream: decode each frame and apply
    /// it. Runs until cancelled or the link side of the channel closes.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<String>,
        counters: Arc<Counters>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                frame = inbound.recv() => match frame {
                    Some(line) => match protocol::decode(&line) {
                        Ok(msg) => self.apply(msg),
                        Err(err) => {
                            counters.record_malformed_frame();
                            warn!("discarding malformed frame: {err}");
                        }
                    },
                    None => return,
                }
            }
        }
    }

    /// Apply one inbound message and notify observers of the resulting
    /// changes.
    pub fn apply(&mut self, msg: InboundMessage) {
        let mut changes = Vec::new();

        match msg {
            InboundMessage::Summary(summary) => self.apply_summary(summary, &mut changes),
            InboundMessage::ZoneActive { zone_id, status } => {
                self.apply_zone_active(zone_id, status, &mut changes)
            }
            InboundMessage::ZoneUpdate { zone } => self.apply_zone_update(zone, &mut changes),
            InboundMessage::ZoneAdd { zone } => self.apply_zone_add(zone, &mut changes),
            InboundMessage::Arming { partition_id, status, delay_secs } => {
                debug!("ARMING partition_id={partition_id} status={}", status.as_wire_str());
                let _ = delay_secs;
                self.apply_arming(partition_id, status, &mut changes);
            }
            InboundMessage::Alarm { partition_id, alarm_type } => {
                self.apply_alarm(partition_id, alarm_type, &mut changes)
            }
            InboundMessage::SecureArm { partition_id, value } => {
                self.apply_secure_arm(partition_id, value, &mut changes)
            }
            InboundMessage::Error { error_type, description, partition_id } => {
                self.apply_error(error_type, description, partition_id, &mut changes)
            }
            InboundMessage::Ack => {
                self.acks += 1;
            }
            InboundMessage::Unrecognized { raw } => {
                let preview: String = raw.chars().take(200).collect();
                info!("ignoring unrecognized frame: {preview}");
            }
        }

        for change in changes {
            self.notify(change);
        }
    }

    fn notify(&self, change: StateChange) {
        for tx in &self.observers {
            let _ = tx.send(change.clone());
        }
    }

    // -- INFO/SUMMARY ------------------------------------------------------

    fn apply_summary(&mut self, summary: SummaryInfo, changes: &mut Vec<StateChange>) {
        if summary.software_version.is_some() && summary.software_version != self.meta.software_version {
            let old = self.meta.software_version.clone().unwrap_or_default();
            let new = summary.software_version.clone().unwrap_or_default();
            self.meta.software_version = summary.software_version.clone();
            changes.push(StateChange {
                entity: EntitySnapshot::Panel(self.meta.clone()),
                change: Change::AttributeChanged { field: "software_version", old, new },
            });
        }

        let mut seen_partitions = Vec::new();
        for record in &summary.partitions {
            seen_partitions.push(record.partition_id);
            self.apply_partition_record(record, changes);
        }

        // Entities absent from the snapshot go offline but stay in the map.
        for partition in self.partitions.values_mut() {
            if seen_partitions.contains(&partition.id) {
                continue;
            }
            if partition.available {
                partition.available = false;
                changes.push(StateChange {
                    entity: EntitySnapshot::Partition(partition.clone()),
                    change: Change::WentOffline,
                });
            }
            for sensor in partition.sensors.values_mut() {
                if sensor.available {
                    sensor.available = false;
                    changes.push(StateChange {
                        entity: EntitySnapshot::Sensor(sensor.clone()),
                        change: Change::WentOffline,
                    });
                }
            }
        }
    }

    fn apply_partition_record(&mut self, record: &PartitionRecord, changes: &mut Vec<StateChange>) {
        let mut partition_changes = Vec::new();
        let mut sensor_changes = Vec::new();

        let is_new = !self.partitions.contains_key(&record.partition_id);
        if is_new {
            let mut partition = Partition::new(record.partition_id, record.name.clone());
            partition.status = record.status;
            partition.secure_arm = record.secure_arm;
            if record.status == PartitionStatus::Alarm {
                partition.alarm_type = Some(AlarmType::Auto);
            }
            self.partitions.insert(record.partition_id, partition);
            partition_changes.push(Change::Created);
        }
        let Some(partition) = self.partitions.get_mut(&record.partition_id) else {
            return;
        };
        if !is_new {
            if !partition.available {
                partition.available = true;
                partition_changes.push(Change::CameOnline);
            }
            diff_partition(partition, record, &mut partition_changes);
        }

        let mut seen_sensors = Vec::new();
        for zone in &record.zones {
            seen_sensors.push(zone.zone_id);
            match partition.sensors.get_mut(&zone.zone_id) {
                Some(sensor) => {
                    let mut per_sensor = Vec::new();
                    if !sensor.available {
                        sensor.available = true;
                        per_sensor.push(Change::CameOnline);
                    }
                    diff_sensor(sensor, zone, &mut per_sensor);
                    for change in per_sensor {
                        sensor_changes.push((sensor.clone(), change));
                    }
                }
                None => {
                    let sensor = sensor_from_record(zone, record.partition_id);
                    partition.sensors.insert(zone.zone_id, sensor.clone());
                    sensor_changes.push((sensor, Change::Created));
                }
            }
        }
        for sensor in partition.sensors.values_mut() {
            if !seen_sensors.contains(&sensor.id) && sensor.available {
                sensor.available = false;
                sensor_changes.push((sensor.clone(), Change::WentOffline));
            }
        }

        let snapshot = partition.clone();
        for change in partition_changes {
            changes.push(StateChange { entity: EntitySnapshot::Partition(snapshot.clone()), change });
        }
        for (sensor, change) in sensor_changes {
            changes.push(StateChange { entity: EntitySnapshot::Sensor(sensor), change });
        }
    }

    // -- Targeted zone updates ---------------------------------------------

    fn apply_zone_active(&mut self, zone_id: u32, status: SensorStatus, changes: &mut Vec<StateChange>) {
        let Some(sensor) = self
            .partitions
            .values_mut()
            .find_map(|p| p.sensor_mut(zone_id))
        else {
            // Referenced sensor missing from the model: the panel and the
            // bridge disagree. Log and keep going; the next SUMMARY heals it.
            error!("zone event for unknown sensor {zone_id}, state may be out of sync");
            return;
        };

        let old = sensor.set_status(status, Utc::now());
        let old_tampered = old == SensorStatus::Tamper;
        if old != status {
            changes.push(StateChange {
                entity: EntitySnapshot::Sensor(sensor.clone()),
                change: Change::AttributeChanged {
                    field: "status",
                    old: old.as_wire_str().to_string(),
                    new: status.as_wire_str().to_string(),
                },
            });
        }
        if old_tampered != sensor.tampered {
            changes.push(StateChange {
                entity: EntitySnapshot::Sensor(sensor.clone()),
                change: Change::AttributeChanged {
                    field: "tampered",
                    old: old_tampered.to_string(),
                    new: sensor.tampered.to_string(),
                },
            });
        }
    }

    fn apply_zone_update(&mut self, zone: SensorRecord, changes: &mut Vec<StateChange>) {
        if !self.partitions.contains_key(&zone.partition_id) {
            warn!("zone update for unknown partition {}", zone.partition_id);
            return;
        }

        // A zone can move between partitions: drop it from wherever it
        // currently lives before upserting into its new home.
        let current_home = self
            .partitions
            .values()
            .find(|p| p.sensors.contains_key(&zone.zone_id) && p.id != zone.partition_id)
            .map(|p| p.id);
        let moved = if let Some(old_partition) = current_home {
            if let Some(p) = self.partitions.get_mut(&old_partition) {
                p.sensors.remove(&zone.zone_id)
            } else {
                None
            }
        } else {
            None
        };

        let Some(partition) = self.partitions.get_mut(&zone.partition_id) else {
            return;
        };
        match partition.sensors.get_mut(&zone.zone_id) {
            Some(sensor) => {
                let mut per_sensor = Vec::new();
                diff_sensor(sensor, &zone, &mut per_sensor);
                for change in per_sensor {
                    changes.push(StateChange { entity: EntitySnapshot::Sensor(sensor.clone()), change });
                }
            }
            None => {
                let mut sensor = sensor_from_record(&zone, zone.partition_id);
                match moved {
                    Some(previous) => {
                        sensor.last_seen = previous.last_seen;
                        let old = previous.partition_id.to_string();
                        partition.sensors.insert(zone.zone_id, sensor.clone());
                        changes.push(StateChange {
                            entity: EntitySnapshot::Sensor(sensor),
                            change: Change::AttributeChanged {
                                field: "partition_id",
                                old,
                                new: zone.partition_id.to_string(),
                            },
                        });
                    }
                    None => {
                        partition.sensors.insert(zone.zone_id, sensor.clone());
                        changes.push(StateChange {
                            entity: EntitySnapshot::Sensor(sensor),
                            change: Change::Created,
                        });
                    }
                }
            }
        }
    }

    fn apply_zone_add(&mut self, zone: SensorRecord, changes: &mut Vec<StateChange>) {
        let Some(partition) = self.partitions.get_mut(&zone.partition_id) else {
            warn!("zone add for unknown partition {}", zone.partition_id);
            return;
        };
        if partition.sensors.contains_key(&zone.zone_id) {
            // Re-announcement of a known zone: treat as an update.
            self.apply_zone_update(zone, changes);
            return;
        }
        let sensor = sensor_from_record(&zone, zone.partition_id);
        partition.sensors.insert(zone.zone_id, sensor.clone());
        changes.push(StateChange { entity: EntitySnapshot::Sensor(sensor), change: Change::Created });
    }

    // -- Partition-level events --------------------------------------------

    fn apply_arming(&mut self, partition_id: u32, status: PartitionStatus, changes: &mut Vec<StateChange>) {
        let Some(partition) = self.partitions.get_mut(&partition_id) else {
            warn!("arming event for unknown partition {partition_id}");
            return;
        };

        let old_alarm = partition.alarm_type;
        let old = partition.set_status(status);
        if old != status {
            changes.push(StateChange {
                entity: EntitySnapshot::Partition(partition.clone()),
                change: Change::AttributeChanged {
                    field: "status",
                    old: old.as_wire_str().to_string(),
                    new: status.as_wire_str().to_string(),
                },
            });
        }
        if old_alarm != partition.alarm_type {
            changes.push(StateChange {
                entity: EntitySnapshot::Partition(partition.clone()),
                change: Change::AttributeChanged {
                    field: "alarm_type",
                    old: alarm_type_str(old_alarm),
                    new: alarm_type_str(partition.alarm_type),
                },
            });
        }
    }

    fn apply_alarm(&mut self, partition_id: u32, alarm_type: Option<AlarmType>, changes: &mut Vec<StateChange>) {
        let Some(partition) = self.partitions.get_mut(&partition_id) else {
            warn!("alarm event for unknown partition {partition_id}");
            return;
        };

        let old_status = partition.status;
        let old_alarm = partition.alarm_type;
        partition.triggered(alarm_type.unwrap_or(AlarmType::Auto));

        if old_status != partition.status {
            changes.push(StateChange {
                entity: EntitySnapshot::Partition(partition.clone()),
                change: Change::AttributeChanged {
                    field: "status",
                    old: old_status.as_wire_str().to_string(),
                    new: partition.status.as_wire_str().to_string(),
                },
            });
        }
        // Emitted last so the alarm state always arrives with its type.
        if old_alarm != partition.alarm_type {
            changes.push(StateChange {
                entity: EntitySnapshot::Partition(partition.clone()),
                change: Change::AttributeChanged {
                    field: "alarm_type",
                    old: alarm_type_str(old_alarm),
                    new: alarm_type_str(partition.alarm_type),
                },
            });
        }
    }

    fn apply_secure_arm(&mut self, partition_id: u32, value: bool, changes: &mut Vec<StateChange>) {
        let Some(partition) = self.partitions.get_mut(&partition_id) else {
            warn!("secure_arm event for unknown partition {partition_id}");
            return;
        };
        if partition.secure_arm == value {
            return;
        }
        partition.secure_arm = value;
        changes.push(StateChange {
            entity: EntitySnapshot::Partition(partition.clone()),
            change: Change::AttributeChanged {
                field: "secure_arm",
                old: (!value).to_string(),
                new: value.to_string(),
            },
        });
    }

    fn apply_error(
        &mut self,
        error_type: String,
        description: String,
        partition_id: Option<u32>,
        changes: &mut Vec<StateChange>,
    ) {
        let at = Utc::now();
        let old = self
            .meta
            .last_error
            .as_ref()
            .map(|e| e.description.clone())
            .unwrap_or_default();
        self.meta.last_error = Some(PanelError {
            error_type: error_type.clone(),
            description: description.clone(),
            at,
        });
        changes.push(StateChange {
            entity: EntitySnapshot::Panel(self.meta.clone()),
            change: Change::AttributeChanged { field: "last_error", old, new: description.clone() },
        });

        if let Some(id) = partition_id {
            if let Some(partition) = self.partitions.get_mut(&id) {
                let old = partition.last_error_desc.clone().unwrap_or_default();
                partition.errored(error_type, description.clone(), at);
                changes.push(StateChange {
                    entity: EntitySnapshot::Partition(partition.clone()),
                    change: Change::AttributeChanged { field: "last_error", old, new: description },
                });
            } else {
                warn!("error event for unknown partition {id}");
            }
        }
    }
}

fn alarm_type_str(alarm_type: Option<AlarmType>) -> String {
    alarm_type.map(|t| t.as_wire_str().to_string()).unwrap_or_default()
}

fn sensor_from_record(record: &SensorRecord, partition_id: u32) -> Sensor {
    let mut sensor = Sensor::new(record.zone_id, partition_id, record.name.clone(), record.zone_type.clone());
    sensor.status = record.status;
    sensor.battery_low = record.battery_low;
    sensor.tampered = record.tampered || record.status == SensorStatus::Tamper;
    sensor
}

/// Mutate `partition` to match `record`, pushing one `AttributeChanged`
/// per field that actually differs.
fn diff_partition(partition: &mut Partition, record: &PartitionRecord, changes: &mut Vec<Change>) {
    if partition.name != record.name {
        changes.push(Change::AttributeChanged {
            field: "name",
            old: std::mem::replace(&mut partition.name, record.name.clone()),
            new: record.name.clone(),
        });
    }
    if partition.secure_arm != record.secure_arm {
        partition.secure_arm = record.secure_arm;
        changes.push(Change::AttributeChanged {
            field: "secure_arm",
            old: (!record.secure_arm).to_string(),
            new: record.secure_arm.to_string(),
        });
    }
    if partition.status != record.status {
        let old_alarm = partition.alarm_type;
        let old = partition.set_status(record.status);
        if record.status == PartitionStatus::Alarm && partition.alarm_type.is_none() {
            partition.alarm_type = Some(AlarmType::Auto);
        }
        changes.push(Change::AttributeChanged {
            field: "status",
            old: old.as_wire_str().to_string(),
            new: record.status.as_wire_str().to_string(),
        });
        if old_alarm != partition.alarm_type {
            changes.push(Change::AttributeChanged {
                field: "alarm_type",
                old: alarm_type_str(old_alarm),
                new: alarm_type_str(partition.alarm_type),
            });
        }
    }
}

/// Mutate `sensor` to match `record`, pushing one `AttributeChanged` per
/// field that actually differs. `last_seen` is bookkeeping, not an
/// observable attribute.
fn diff_sensor(sensor: &mut Sensor, record: &SensorRecord, changes: &mut Vec<Change>) {
    if sensor.name != record.name {
        changes.push(Change::AttributeChanged {
            field: "name",
            old: std::mem::replace(&mut sensor.name, record.name.clone()),
            new: record.name.clone(),
        });
    }
    if sensor.zone_type != record.zone_type {
        let old = std::mem::replace(&mut sensor.zone_type, record.zone_type.clone());
        sensor.class = SensorClass::from_zone_type(&record.zone_type);
        changes.push(Change::AttributeChanged {
            field: "zone_type",
            old,
            new: record.zone_type.clone(),
        });
    }
    if sensor.status != record.status {
        let old = sensor.set_status(record.status, Utc::now());
        changes.push(Change::AttributeChanged {
            field: "status",
            old: old.as_wire_str().to_string(),
            new: record.status.as_wire_str().to_string(),
        });
    }
    if sensor.battery_low != record.battery_low {
        sensor.battery_low = record.battery_low;
        changes.push(Change::AttributeChanged {
            field: "battery_low",
            old: (!record.battery_low).to_string(),
            new: record.battery_low.to_string(),
        });
    }
    let tampered = record.tampered || record.status == SensorStatus::Tamper;
    if sensor.tampered != tampered {
        sensor.tampered = tampered;
        changes.push(Change::AttributeChanged {
            field: "tampered",
            old: (!tampered).to_string(),
            new: tampered.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::observer_channel;
    use crate::event::ObserverReceiver;
    use crate::protocol::decode;

    fn observed_state() -> (PanelState, ObserverReceiver) {
        let mut state = PanelState::new();
        let (tx, rx) = observer_channel();
        state.register_observer(tx);
        (state, rx)
    }

    fn drain(rx: &mut ObserverReceiver) -> Vec<StateChange> {
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(change);
        }
        changes
    }

    fn summary_frame() -> InboundMessage {
        decode(
            r#"{"event":"INFO","info_type":"SUMMARY","partition_list":[{"partition_id":0,"name":"home","status":"DISARM","secure_arm":false,"zone_list":[{"zone_id":1,"name":"Front Door","zone_type":"DoorWindow","status":"Closed"}]}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn summary_creates_partition_then_sensor() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0].entity, EntitySnapshot::Partition(_)));
        assert_eq!(changes[0].change, Change::Created);
        assert!(matches!(changes[1].entity, EntitySnapshot::Sensor(_)));
        assert_eq!(changes[1].change, Change::Created);

        let partition = state.partition(0).unwrap();
        assert_eq!(partition.name, "home");
        assert_eq!(partition.status, PartitionStatus::Disarm);
        assert_eq!(partition.sensor(1).unwrap().name, "Front Door");
    }

    #[test]
    fn same_summary_twice_is_silent() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        state.apply(summary_frame());
        assert!(drain(&mut rx).is_empty(), "second identical summary must emit nothing");
    }

    #[test]
    fn summary_diff_emits_exactly_changed_fields() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        let updated = decode(
            r#"{"event":"INFO","info_type":"SUMMARY","partition_list":[{"partition_id":0,"name":"home","status":"ARM_STAY","secure_arm":false,"zone_list":[{"zone_id":1,"name":"Front Door","zone_type":"DoorWindow","status":"Open"}]}]}"#,
        )
        .unwrap();
        state.apply(updated);

        let changed: Vec<_> = drain(&mut rx).iter().filter_map(|c| c.attribute()).collect();
        assert_eq!(changed, vec!["status", "status"]);
    }

    #[test]
    fn summary_removal_marks_offline_not_deleted() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        let empty = decode(r#"{"event":"INFO","info_type":"SUMMARY","partition_list":[]}"#).unwrap();
        state.apply(empty.clone());

        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change, Change::WentOffline);
        assert_eq!(changes[1].change, Change::WentOffline);
        assert!(state.partition(0).is_some(), "offline partition must stay in the model");
        assert!(!state.partition(0).unwrap().available);

        // Idempotent: a second empty summary emits nothing.
        state.apply(empty);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn summary_reappearance_emits_came_online() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        state.apply(decode(r#"{"event":"INFO","info_type":"SUMMARY","partition_list":[]}"#).unwrap());
        drain(&mut rx);

        state.apply(summary_frame());
        let changes = drain(&mut rx);
        assert!(changes.iter().any(|c| c.change == Change::CameOnline));
        assert!(state.partition(0).unwrap().available);
    }

    #[test]
    fn zone_active_targets_one_sensor() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        state.apply(InboundMessage::ZoneActive { zone_id: 1, status: SensorStatus::Open });
        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].attribute(), Some("status"));
        assert_eq!(state.sensor(1).unwrap().status, SensorStatus::Open);
        assert!(state.sensor(1).unwrap().last_seen.is_some());
    }

    #[test]
    fn zone_active_for_unknown_sensor_is_survivable() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        state.apply(InboundMessage::ZoneActive { zone_id: 99, status: SensorStatus::Open });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn zone_update_moves_sensor_between_partitions() {
        let (mut state, mut rx) = observed_state();
        let two_partitions = decode(
            r#"{"event":"INFO","info_type":"SUMMARY","partition_list":[{"partition_id":0,"name":"home","status":"DISARM","zone_list":[{"zone_id":1,"name":"Front Door","zone_type":"DoorWindow","status":"Closed"}]},{"partition_id":1,"name":"garage","status":"DISARM","zone_list":[]}]}"#,
        )
        .unwrap();
        state.apply(two_partitions);
        drain(&mut rx);

        let moved = decode(
            r#"{"event":"ZONE_EVENT","zone_event_type":"ZONE_UPDATE","zone":{"zone_id":1,"partition_id":1,"name":"Front Door","zone_type":"DoorWindow","status":"Closed"}}"#,
        )
        .unwrap();
        state.apply(moved);

        assert!(state.partition(0).unwrap().sensor(1).is_none());
        assert_eq!(state.partition(1).unwrap().sensor(1).unwrap().partition_id, 1);
        let changes = drain(&mut rx);
        assert!(changes.iter().any(|c| c.attribute() == Some("partition_id")));
    }

    #[test]
    fn zone_add_creates_sensor() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        let add = decode(
            r#"{"event":"ZONE_EVENT","zone_event_type":"ZONE_ADD","zone":{"zone_id":2,"partition_id":0,"name":"Motion","zone_type":"Motion","status":"Idle"}}"#,
        )
        .unwrap();
        state.apply(add);
        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change, Change::Created);
        assert_eq!(state.sensor(2).unwrap().class, SensorClass::Motion);
    }

    #[test]
    fn arming_updates_status() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        state.apply(InboundMessage::Arming {
            partition_id: 0,
            status: PartitionStatus::ExitDelay,
            delay_secs: Some(60),
        });
        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].attribute(), Some("status"));
        assert_eq!(state.partition(0).unwrap().status, PartitionStatus::ExitDelay);
    }

    #[test]
    fn alarm_sets_alarm_type_last() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        state.apply(InboundMessage::Alarm { partition_id: 0, alarm_type: Some(AlarmType::Police) });
        let changes = drain(&mut rx);
        let attrs: Vec<_> = changes.iter().filter_map(|c| c.attribute()).collect();
        assert_eq!(attrs, vec!["status", "alarm_type"]);
        assert_eq!(state.partition(0).unwrap().alarm_type, Some(AlarmType::Police));

        // Disarming clears the alarm type again.
        state.apply(InboundMessage::Arming {
            partition_id: 0,
            status: PartitionStatus::Disarm,
            delay_secs: None,
        });
        assert_eq!(state.partition(0).unwrap().alarm_type, None);
        let attrs: Vec<_> = drain(&mut rx).iter().filter_map(|c| c.attribute()).collect::<Vec<_>>();
        assert!(attrs.contains(&"alarm_type"));
    }

    #[test]
    fn alarm_without_type_defaults_to_auto() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        state.apply(InboundMessage::Alarm { partition_id: 0, alarm_type: None });
        assert_eq!(state.partition(0).unwrap().alarm_type, Some(AlarmType::Auto));
    }

    #[test]
    fn secure_arm_is_idempotent() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        state.apply(InboundMessage::SecureArm { partition_id: 0, value: true });
        assert_eq!(drain(&mut rx).len(), 1);
        state.apply(InboundMessage::SecureArm { partition_id: 0, value: true });
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn error_recorded_on_panel_and_partition() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        state.apply(InboundMessage::Error {
            error_type: "DisarmFailed".to_string(),
            description: "Invalid usercode".to_string(),
            partition_id: Some(0),
        });
        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0].entity, EntitySnapshot::Panel(_)));
        assert!(matches!(changes[1].entity, EntitySnapshot::Partition(_)));
        assert_eq!(state.meta().last_error.as_ref().unwrap().error_type, "DisarmFailed");
        assert_eq!(
            state.partition(0).unwrap().last_error_desc.as_deref(),
            Some("Invalid usercode")
        );
    }

    #[test]
    fn ack_is_not_observable() {
        let (mut state, mut rx) = observed_state();
        state.apply(InboundMessage::Ack);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn panel_changes_precede_partition_changes() {
        let (mut state, mut rx) = observed_state();
        state.apply(summary_frame());
        drain(&mut rx);

        let versioned = decode(
            r#"{"event":"INFO","info_type":"SUMMARY","version":"4.4.1","partition_list":[{"partition_id":0,"name":"home","status":"ARM_AWAY","secure_arm":false,"zone_list":[{"zone_id":1,"name":"Front Door","zone_type":"DoorWindow","status":"Closed"}]}]}"#,
        )
        .unwrap();
        state.apply(versioned);

        let changes = drain(&mut rx);
        assert!(matches!(changes[0].entity, EntitySnapshot::Panel(_)));
        assert!(matches!(changes[1].entity, EntitySnapshot::Partition(_)));
    }
}

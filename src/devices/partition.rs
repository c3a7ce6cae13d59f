// MIT License - Copyright (c) 2026 Peter Wright

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::devices::sensor::Sensor;

/// Partition arming status as reported by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionStatus {
    Disarm,
    ArmStay,
    ArmAway,
    EntryDelay,
    ExitDelay,
    Alarm,
}

impl PartitionStatus {
    /// Parse a panel status string. Some firmwares report exit delays as
    /// `ARM-AWAY-EXIT-DELAY` / `ARM-STAY-EXIT-DELAY` instead of
    /// `EXIT_DELAY`; both forms are accepted.
    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "DISARM" => Some(Self::Disarm),
            "ARM_STAY" => Some(Self::ArmStay),
            "ARM_AWAY" => Some(Self::ArmAway),
            "ENTRY_DELAY" => Some(Self::EntryDelay),
            "EXIT_DELAY" | "ARM-AWAY-EXIT-DELAY" | "ARM-STAY-EXIT-DELAY" => Some(Self::ExitDelay),
            "ALARM" => Some(Self::Alarm),
            _ => None,
        }
    }

    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Disarm => "DISARM",
            Self::ArmStay => "ARM_STAY",
            Self::ArmAway => "ARM_AWAY",
            Self::EntryDelay => "ENTRY_DELAY",
            Self::ExitDelay => "EXIT_DELAY",
            Self::Alarm => "ALARM",
        }
    }

    /// The Home Assistant alarm_control_panel state string.
    pub fn ha_state(&self) -> &'static str {
        match self {
            Self::Disarm => "disarmed",
            Self::ArmStay => "armed_home",
            Self::ArmAway => "armed_away",
            Self::EntryDelay => "pending",
            Self::ExitDelay => "arming",
            Self::Alarm => "triggered",
        }
    }
}

/// Alarm type carried by ALARM events and TRIGGER actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmType {
    Police,
    Fire,
    Auxiliary,
    Auto,
}

impl AlarmType {
    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s {
            "POLICE" => Some(Self::Police),
            "FIRE" => Some(Self::Fire),
            "AUXILIARY" | "AUX" => Some(Self::Auxiliary),
            "AUTO" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Police => "POLICE",
            Self::Fire => "FIRE",
            Self::Auxiliary => "AUXILIARY",
            Self::Auto => "AUTO",
        }
    }
}

/// A single alarm partition with its sensors.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub id: u32,
    pub name: String,
    pub status: PartitionStatus,
    pub secure_arm: bool,
    pub alarm_type: Option<AlarmType>,
    pub sensors: BTreeMap<u32, Sensor>,
    pub available: bool,
    pub last_error_type: Option<String>,
    pub last_error_desc: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl Partition {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: PartitionStatus::Disarm,
            secure_arm: false,
            alarm_type: None,
            sensors: BTreeMap::new(),
            available: true,
            last_error_type: None,
            last_error_desc: None,
            last_error_at: None,
        }
    }

    /// Update the arming status. Leaving `Alarm` clears the alarm type;
    /// entering it without one is handled by [`Partition::triggered`].
    pub fn set_status(&mut self, status: PartitionStatus) -> PartitionStatus {
        let old = self.status;
        self.status = status;
        if status != PartitionStatus::Alarm {
            self.alarm_type = None;
        }
        old
    }

    /// Enter the alarm state with the given alarm type.
    pub fn triggered(&mut self, alarm_type: AlarmType) {
        self.status = PartitionStatus::Alarm;
        self.alarm_type = Some(alarm_type);
    }

    /// Record a panel-reported error against this partition.
    pub fn errored(&mut self, error_type: impl Into<String>, description: impl Into<String>, at: DateTime<Utc>) {
        self.last_error_type = Some(error_type.into());
        self.last_error_desc = Some(description.into());
        self.last_error_at = Some(at);
    }

    pub fn sensor(&self, id: u32) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    pub fn sensor_mut(&mut self, id: u32) -> Option<&mut Sensor> {
        self.sensors.get_mut(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_wire_str() {
        assert_eq!(PartitionStatus::from_wire_str("DISARM"), Some(PartitionStatus::Disarm));
        assert_eq!(PartitionStatus::from_wire_str("ARM_STAY"), Some(PartitionStatus::ArmStay));
        assert_eq!(
            PartitionStatus::from_wire_str("ARM-AWAY-EXIT-DELAY"),
            Some(PartitionStatus::ExitDelay)
        );
        assert_eq!(PartitionStatus::from_wire_str("NOT_A_STATUS"), None);
    }

    #[test]
    fn ha_state_mapping() {
        assert_eq!(PartitionStatus::Disarm.ha_state(), "disarmed");
        assert_eq!(PartitionStatus::ArmStay.ha_state(), "armed_home");
        assert_eq!(PartitionStatus::ArmAway.ha_state(), "armed_away");
        assert_eq!(PartitionStatus::EntryDelay.ha_state(), "pending");
        assert_eq!(PartitionStatus::ExitDelay.ha_state(), "arming");
        assert_eq!(PartitionStatus::Alarm.ha_state(), "triggered");
    }

    #[test]
    fn leaving_alarm_clears_alarm_type() {
        let mut part = Partition::new(0, "home");
        part.triggered(AlarmType::Police);
        assert_eq!(part.status, PartitionStatus::Alarm);
        assert_eq!(part.alarm_type, Some(AlarmType::Police));

        part.set_status(PartitionStatus::Disarm);
        assert_eq!(part.alarm_type, None);
    }

    #[test]
    fn alarm_status_keeps_alarm_type() {
        let mut part = Partition::new(0, "home");
        part.triggered(AlarmType::Fire);
        part.set_status(PartitionStatus::Alarm);
        assert_eq!(part.alarm_type, Some(AlarmType::Fire));
    }

    #[test]
    fn errored_records_details() {
        let mut part = Partition::new(0, "home");
        let now = Utc::now();
        part.errored("DISARM_FAILED", "Invalid usercode", now);
        assert_eq!(part.last_error_type.as_deref(), Some("DISARM_FAILED"));
        assert_eq!(part.last_error_at, Some(now));
    }
}

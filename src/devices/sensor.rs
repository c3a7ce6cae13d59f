// MIT License - Copyright (c) 2026 Peter Wright

use chrono::{DateTime, Utc};

/// Sensor status as reported by the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorStatus {
    Open,
    Closed,
    Active,
    Idle,
    Tamper,
}

impl SensorStatus {
    /// Parse a panel status string (e.g., "Open", "Closed").
    pub fn from_wire_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            "active" => Some(Self::Active),
            "idle" | "normal" => Some(Self::Idle),
            "tamper" | "tampered" => Some(Self::Tamper),
            _ => None,
        }
    }

    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
            Self::Active => "Active",
            Self::Idle => "Idle",
            Self::Tamper => "Tamper",
        }
    }

    /// Whether this status maps to the binary_sensor on-payload.
    pub fn is_triggered(&self) -> bool {
        matches!(self, Self::Open | Self::Active | Self::Tamper)
    }
}

/// Derived sensor class, selected from the panel's `zone_type` string.
///
/// Drives the Home Assistant `device_class` of the binary_sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorClass {
    DoorWindow,
    Motion,
    GlassBreak,
    Smoke,
    CarbonMonoxide,
    Water,
    Heat,
    Tilt,
    Freeze,
    Panel,
    Keypad,
    Siren,
    Auxiliary,
    Translator,
    Bluetooth,
    Generic,
}

impl SensorClass {
    /// Derive the class from a panel zone_type string.
    ///
    /// Panel firmwares disagree on spelling ("Door_Window", "DoorWindow",
    /// "door window"), so matching is done on a normalized form. Unknown
    /// zone types fall back to `Generic`.
    pub fn from_zone_type(zone_type: &str) -> Self {
        let normalized: String = zone_type
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "doorwindow" | "doorwindowm" => Self::DoorWindow,
            "motion" | "panelmotion" => Self::Motion,
            "glassbreak" | "panelglassbreak" => Self::GlassBreak,
            "smokedetector" | "smokem" | "smoke" => Self::Smoke,
            "codetector" | "co" => Self::CarbonMonoxide,
            "water" | "waterdetector" => Self::Water,
            "heat" | "temperature" => Self::Heat,
            "tilt" => Self::Tilt,
            "freeze" => Self::Freeze,
            "panel" => Self::Panel,
            "keypad" => Self::Keypad,
            "siren" => Self::Siren,
            "auxiliarypendant" | "auxiliary" => Self::Auxiliary,
            "takeovermodule" | "translator" => Self::Translator,
            "bluetooth" => Self::Bluetooth,
            _ => Self::Generic,
        }
    }

    /// The Home Assistant device_class for this sensor class.
    ///
    /// `Generic` has no fixed mapping; the MQTT surface substitutes the
    /// configured default device class for it.
    pub fn ha_device_class(&self) -> Option<&'static str> {
        match self {
            Self::DoorWindow => Some("door"),
            Self::Motion => Some("motion"),
            Self::GlassBreak => Some("vibration"),
            Self::Smoke => Some("smoke"),
            Self::CarbonMonoxide => Some("gas"),
            Self::Water => Some("moisture"),
            Self::Heat => Some("heat"),
            Self::Tilt => Some("garage_door"),
            Self::Freeze => Some("cold"),
            Self::Bluetooth => Some("presence"),
            Self::Panel | Self::Keypad | Self::Siren | Self::Auxiliary | Self::Translator => {
                Some("safety")
            }
            Self::Generic => None,
        }
    }
}

/// A single alarm sensor (panel "zone").
#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    pub id: u32,
    pub partition_id: u32,
    pub name: String,
    pub zone_type: String,
    pub class: SensorClass,
    pub status: SensorStatus,
    pub battery_low: bool,
    pub tampered: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub available: bool,
}

impl Sensor {
    pub fn new(id: u32, partition_id: u32, name: impl Into<String>, zone_type: impl Into<String>) -> Self {
        let zone_type = zone_type.into();
        let class = SensorClass::from_zone_type(&zone_type);
        Self {
            id,
            partition_id,
            name: name.into(),
            zone_type,
            class,
            status: SensorStatus::Closed,
            battery_low: false,
            tampered: false,
            last_seen: None,
            available: true,
        }
    }

    /// Update the status, touching `last_seen` and the tamper flag.
    /// Returns the previous status.
    pub fn set_status(&mut self, status: SensorStatus, at: DateTime<Utc>) -> SensorStatus {
        let old = self.status;
        self.status = status;
        self.tampered = status == SensorStatus::Tamper;
        self.last_seen = Some(at);
        old
    }
}

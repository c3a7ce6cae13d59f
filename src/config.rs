// MIT License - Copyright (c) 2026 Peter Wright

use clap::{ArgAction, Parser};
use rumqttc::QoS;
use tracing::warn;

use crate::devices::partition::AlarmType;
use crate::error::ConfigError;

/// Daemon configuration. Every option is settable as a CLI flag or an
/// environment variable; the env names are the public surface, the flags
/// mostly exist for ad-hoc runs.
///
/// Immutable after [`Config::validate`].
#[derive(Parser, Debug, Clone)]
#[command(name = "qolsys2mqtt")]
#[command(about = "Bridge between a Qolsys IQ alarm panel and MQTT / Home Assistant")]
pub struct Config {
    /// Panel hostname or IP address.
    #[arg(long, env = "QOLSYS_PANEL_HOST")]
    pub panel_host: String,

    /// Panel Control4 TLS port.
    #[arg(long, env = "QOLSYS_PANEL_PORT", default_value_t = 12345)]
    pub panel_port: u16,

    /// Secure token from the panel's Control4 integration screen.
    #[arg(long, env = "QOLSYS_PANEL_TOKEN", hide_env_values = true)]
    pub panel_token: String,

    /// Panel user code for arming/disarming (4 or 6 digits).
    #[arg(long, env = "QOLSYS_PANEL_USER_CODE", hide_env_values = true)]
    pub panel_user_code: Option<String>,

    /// Stable identifier, present verbatim in every MQTT topic this
    /// instance owns.
    #[arg(long, env = "QOLSYS_PANEL_UNIQUE_ID", default_value = "qolsys_panel")]
    pub panel_unique_id: String,

    /// Device name shown in Home Assistant.
    #[arg(long, env = "QOLSYS_PANEL_DEVICE_NAME", default_value = "Qolsys Panel")]
    pub panel_device_name: String,

    /// Panel MAC address, used to link the HA device entry.
    #[arg(long, env = "QOLSYS_PANEL_MAC")]
    pub panel_mac: Option<String>,

    /// Verify the panel's TLS certificate. Off by default: the panel
    /// presents a self-signed certificate and is authenticated by token.
    #[arg(long, env = "QOLSYS_PANEL_VERIFY_TLS", default_value_t = false, action = ArgAction::Set)]
    pub panel_verify_tls: bool,

    /// Exit delay in seconds when arming away (0 = instant).
    #[arg(long, env = "QOLSYS_ARM_AWAY_EXIT_DELAY")]
    pub arm_away_exit_delay: Option<u32>,

    /// Exit delay in seconds when arming stay (0 = instant).
    #[arg(long, env = "QOLSYS_ARM_STAY_EXIT_DELAY")]
    pub arm_stay_exit_delay: Option<u32>,

    /// Bypass open sensors when arming away.
    #[arg(long, env = "QOLSYS_ARM_AWAY_BYPASS", action = ArgAction::Set)]
    pub arm_away_bypass: Option<bool>,

    /// Bypass open sensors when arming stay.
    #[arg(long, env = "QOLSYS_ARM_STAY_BYPASS", action = ArgAction::Set)]
    pub arm_stay_bypass: Option<bool>,

    /// Default trigger command advertised to HA (TRIGGER, TRIGGER_FIRE,
    /// TRIGGER_POLICE or TRIGGER_AUXILIARY).
    #[arg(long, env = "QOLSYS_TRIGGER_DEFAULT_COMMAND")]
    pub trigger_default_command: Option<String>,

    /// Device class used for sensors the bridge cannot classify.
    #[arg(long, env = "QOLSYS_SENSOR_DEFAULT_DEVICE_CLASS", default_value = "safety")]
    pub sensor_default_device_class: String,

    /// MQTT broker hostname or IP.
    #[arg(long, env = "MQTT_HOST")]
    pub mqtt_host: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// QoS for every publish and subscription (0-2).
    #[arg(long, env = "MQTT_QOS", default_value_t = 1)]
    pub mqtt_qos: u8,

    /// Retain discovery/state/availability messages.
    #[arg(long, env = "MQTT_RETAIN", default_value_t = true, action = ArgAction::Set)]
    pub mqtt_retain: bool,

    /// Home Assistant MQTT discovery prefix.
    #[arg(long, env = "HA_DISCOVERY_PREFIX", default_value = "homeassistant")]
    pub ha_discovery_prefix: String,

    /// Validate user codes in the bridge instead of forwarding them.
    #[arg(long, env = "HA_CHECK_USER_CODE", default_value_t = true, action = ArgAction::Set)]
    pub ha_check_user_code: bool,

    /// Code HA users enter, when different from the panel code.
    #[arg(long, env = "HA_USER_CODE", hide_env_values = true)]
    pub ha_user_code: Option<String>,

    #[arg(long, env = "HA_CODE_ARM_REQUIRED", default_value_t = false, action = ArgAction::Set)]
    pub ha_code_arm_required: bool,

    #[arg(long, env = "HA_CODE_DISARM_REQUIRED", default_value_t = false, action = ArgAction::Set)]
    pub ha_code_disarm_required: bool,

    #[arg(long, env = "HA_CODE_TRIGGER_REQUIRED", default_value_t = false, action = ArgAction::Set)]
    pub ha_code_trigger_required: bool,

    /// Topic HA announces its own availability on. Defaults to
    /// `{discovery_prefix}/status`.
    #[arg(long, env = "HA_STATUS_TOPIC")]
    pub ha_status_topic: Option<String>,

    /// Payload on the status topic that means HA came (back) online.
    #[arg(long, env = "HA_STATUS_ONLINE_PAYLOAD", default_value = "online")]
    pub ha_status_online_payload: String,

    /// Extra operator-provided token accepted on control commands, in
    /// addition to the per-process session token.
    #[arg(long, env = "USER_CONTROL_TOKEN", hide_env_values = true)]
    pub user_control_token: Option<String>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// A user code the panel will accept: 4 or 6 digits, nothing else.
pub fn is_valid_user_code(code: &str) -> bool {
    matches!(code.len(), 4 | 6) && code.chars().all(|c| c.is_ascii_digit())
}

impl Config {
    /// Apply cross-field rules. Called once at startup; a failure here is
    /// fatal (exit code 1).
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if let Some(code) = &self.panel_user_code
            && !is_valid_user_code(code)
        {
            return Err(ConfigError::BadUserCode { field: "panel_user_code" });
        }
        if let Some(code) = &self.ha_user_code
            && !is_valid_user_code(code)
        {
            return Err(ConfigError::BadUserCode { field: "ha_user_code" });
        }

        if self.panel_user_code.is_none() {
            if self.ha_user_code.is_some() {
                return Err(ConfigError::HaCodeWithoutPanelCode);
            }
            if self.ha_code_arm_required || self.ha_code_trigger_required {
                return Err(ConfigError::CodeRequiredWithoutPanelCode);
            }
            // Without a panel code the bridge has nothing to check codes
            // against, and disarming needs HA to supply one.
            self.ha_check_user_code = false;
            if !self.ha_code_disarm_required {
                self.ha_code_disarm_required = true;
                warn!("no panel_user_code configured, disarm will require a code from HA");
            }
        }

        if let Some(cmd) = &self.trigger_default_command {
            let upper = cmd.trim().to_ascii_uppercase();
            match upper.as_str() {
                "TRIGGER" | "TRIGGER_FIRE" | "TRIGGER_POLICE" | "TRIGGER_AUXILIARY" => {
                    self.trigger_default_command = Some(upper);
                }
                _ => return Err(ConfigError::BadTriggerCommand { value: cmd.clone() }),
            }
        }

        if self.mqtt_qos > 2 {
            return Err(ConfigError::BadQos { value: self.mqtt_qos });
        }

        if self.panel_unique_id.is_empty()
            || !self
                .panel_unique_id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ConfigError::BadUniqueId);
        }

        Ok(())
    }

    /// The HA status topic, defaulted to `{discovery_prefix}/status`.
    pub fn ha_status_topic(&self) -> String {
        self.ha_status_topic
            .clone()
            .unwrap_or_else(|| format!("{}/status", self.ha_discovery_prefix))
    }

    /// Instance-level availability topic (carries the LWT).
    pub fn instance_availability_topic(&self) -> String {
        format!("{}/{}/availability", self.ha_discovery_prefix, self.panel_unique_id)
    }

    /// Control topic filter covering every partition's `set` topic.
    pub fn control_topic_filter(&self) -> String {
        format!(
            "{}/alarm_control_panel/{}/+/set",
            self.ha_discovery_prefix, self.panel_unique_id
        )
    }

    /// The alarm type a bare TRIGGER maps to.
    pub fn default_trigger_alarm_type(&self) -> AlarmType {
        match self.trigger_default_command.as_deref() {
            Some("TRIGGER_FIRE") => AlarmType::Fire,
            Some("TRIGGER_AUXILIARY") => AlarmType::Auxiliary,
            // TRIGGER and TRIGGER_POLICE both mean police.
            _ => AlarmType::Police,
        }
    }

    pub fn qos(&self) -> QoS {
        match self.mqtt_qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }
}

// Events and the tag catalogue shared by every manager

//! # Events
//!
//! An [`Event`] is a `{tag, data, timestamp}` record. The tag is a `/`-separated
//! path such as `system/power/sleep` or `engine/running`, and events travel on
//! the bus topic `event/<tag-head>` (for example `event/system`).
//!
//! The [`tags`] module is the stable catalogue of tags other processes rely
//! on. Build tags through its functions instead of formatting strings by hand
//! so a typo cannot drift a tag away from its bit-exact form.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::result::{self, ResultMap};
use crate::utils::glob_match;

/// Topic prefix for every event on the bus
pub const TOPIC_PREFIX: &str = "event";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub tag: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(tag: impl Into<String>, data: Value) -> Self {
        Self {
            tag: tag.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// First segment of the tag
    pub fn head(&self) -> &str {
        self.tag.split('/').next().unwrap_or_default()
    }

    /// Bus topic this event is published on
    pub fn topic(&self) -> String {
        format!("{}/{}", TOPIC_PREFIX, self.head())
    }

    pub fn matches(&self, pattern: &str) -> bool {
        glob_match(pattern, &self.tag)
    }

    /// The event as a result dictionary, ready for a returner
    ///
    /// `_type` is `event.` followed by the dot-joined tag; object data is
    /// spread into the result, anything else is wrapped.
    pub fn to_result(&self) -> ResultMap {
        let mut converted = result::wrap(self.data.clone());
        converted.insert(
            result::TYPE.to_string(),
            Value::String(format!("event.{}", self.tag.replace('/', "."))),
        );
        converted.insert(
            result::STAMP.to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        converted
    }

    pub fn as_value(&self) -> Value {
        json!({
            "tag": self.tag,
            "data": self.data,
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        })
    }
}

/// Stable event tags
///
/// ## Rust Learning Notes:
///
/// ### Declarative Macros
/// `macro_rules!` lets us stamp out the same enum shape (variants, `as_str`,
/// `Display`, `FromStr`) for every family of states without repeating the
/// boilerplate by hand. The macro is only visible inside this module.
pub mod tags {
    use std::fmt;
    use std::str::FromStr;

    use crate::EdmpError;

    macro_rules! tag_states {
        ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant),+
            }

            impl $name {
                pub fn as_str(&self) -> &'static str {
                    match self {
                        $($name::$variant => $text),+
                    }
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }

            impl FromStr for $name {
                type Err = EdmpError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    match s {
                        $($text => Ok($name::$variant),)+
                        other => Err(EdmpError::InvalidInput(format!(
                            "unknown {} '{}'",
                            stringify!($name),
                            other
                        ))),
                    }
                }
            }
        };
    }

    tag_states!(PowerState {
        Sleep => "sleep",
        Hibernate => "hibernate",
        Reboot => "reboot",
        Recover => "recover",
        On => "on",
        Off => "off",
        Booting => "booting",
    });

    tag_states!(TimeState {
        Synced => "synced",
        Uncertain => "uncertain",
    });

    tag_states!(RfidState {
        Read => "read",
        Authenticated => "authenticated",
        Rejected => "rejected",
    });

    tag_states!(Connection {
        Connected => "connected",
        Disconnected => "disconnected",
    });

    tag_states!(UsbState {
        Connected => "connected",
        Disconnected => "disconnected",
        NotConnected => "not_connected",
    });

    tag_states!(ContainerAction {
        Start => "start",
        Stop => "stop",
    });

    tag_states!(CertificateState {
        Signed => "signed",
        Expiring => "expiring",
        Valid => "valid",
        Invalid => "invalid",
        Missing => "missing",
    });

    tag_states!(EngineState {
        Running => "running",
        Stopped => "stopped",
    });

    tag_states!(BatteryState {
        Charging => "charging",
        Discharging => "discharging",
        Overcharging => "overcharging",
        ChargingSlow => "charging_slow",
        CriticalLevel => "critical_level",
    });

    tag_states!(PositionState {
        Unknown => "unknown",
        Standstill => "standstill",
        Moving => "moving",
    });

    tag_states!(GeofenceState {
        Inside => "inside",
        Outside => "outside",
    });

    tag_states!(
        /// Worker lifecycle events
        WorkerEvent {
            Started => "started",
            Killed => "killed",
            Completed => "completed",
            Failed => "failed",
        }
    );

    tag_states!(
        /// Manager lifecycle events
        ServiceEvent {
            Started => "started",
            Stopped => "stopped",
            Failed => "failed",
        }
    );

    pub fn power(state: PowerState) -> String {
        format!("system/power/{}", state)
    }

    pub fn time(state: TimeState) -> String {
        format!("system/time/{}", state)
    }

    pub fn sms_received() -> String {
        "system/sms/received".to_string()
    }

    pub fn kernel_error() -> String {
        "system/kernel/error".to_string()
    }

    pub fn mosquitto_error() -> String {
        "system/mosquitto/error".to_string()
    }

    pub fn rfid(rfid: &str, state: RfidState) -> String {
        format!("system/rfid/{}/{}", rfid, state)
    }

    pub fn hostapd_client(mac: &str, state: Connection) -> String {
        format!("system/hostapd/client/{}/{}", mac, state)
    }

    pub fn usb(vendor: &str, product: &str, state: UsbState) -> String {
        format!("system/usb/{}/{}/{}", vendor, product, state)
    }

    pub fn docker_container(name: &str, action: ContainerAction) -> String {
        format!("system/docker/container/{}/{}", name, action)
    }

    pub fn certificate(state: CertificateState) -> String {
        format!("system/certificate/{}", state)
    }

    pub fn engine(state: EngineState) -> String {
        format!("engine/{}", state)
    }

    pub fn battery(state: BatteryState) -> String {
        format!("battery/{}", state)
    }

    pub fn position(state: PositionState) -> String {
        format!("vehicle/position/{}", state)
    }

    pub fn geofence(state: GeofenceState) -> String {
        format!("vehicle/geofence/{}", state)
    }

    pub fn key_fob_action(name: &str) -> String {
        format!("vehicle/key_fob/action/{}", name)
    }

    pub fn key_fob_power(name: &str) -> String {
        format!("vehicle/key_fob/power/{}", name)
    }

    pub fn worker(name: &str, event: WorkerEvent) -> String {
        format!("worker/{}/{}", name, event)
    }

    pub fn service(manager: &str, event: ServiceEvent) -> String {
        format!("system/service/{}/{}", manager, event)
    }
}

//! Barriers (gates and garage doors)
//!
//! [`Barrier`] is a snapshot taken by [`Session::get_all_barriers`]. Its
//! control methods go through the session that produced it, so they use
//! whatever token and endpoints the session holds at call time.

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{NiceGoError, Result};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub updated_timestamp: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BarrierState {
    pub device_id: String,
    pub desired: Map<String, Value>,
    pub reported: Map<String, Value>,
    pub timestamp: String,
    pub version: String,
    /// Absent when the gateway has never seen the device
    pub connection_state: Option<ConnectionState>,
}

#[derive(Clone)]
pub struct Barrier {
    pub id: String,
    pub kind: String,
    pub control_level: String,
    pub attributes: Vec<Attribute>,
    pub state: BarrierState,
    session: Session,
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("control_level", &self.control_level)
            .field("attributes", &self.attributes)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Barrier {
    pub(crate) fn from_record(record: DeviceRecord, session: Session) -> Result<Self> {
        let state = record.state;
        Ok(Self {
            id: record.id,
            kind: record.kind,
            control_level: record.control_level,
            attributes: record.attr,
            state: BarrierState {
                device_id: state.device_id,
                desired: decode_document(state.desired, "desired")?,
                reported: decode_document(state.reported, "reported")?,
                timestamp: state.timestamp,
                version: state.version,
                connection_state: state.connection_state.map(|c| ConnectionState {
                    connected: c.connected,
                    updated_timestamp: c.updated_timestamp,
                }),
            },
            session,
        })
    }

    pub async fn open(&self) -> Result<bool> {
        self.session.open_barrier(&self.id).await
    }

    pub async fn close(&self) -> Result<bool> {
        self.session.close_barrier(&self.id).await
    }

    pub async fn light_on(&self) -> Result<bool> {
        self.session.light_on(&self.id).await
    }

    pub async fn light_off(&self) -> Result<bool> {
        self.session.light_off(&self.id).await
    }

    pub async fn vacation_mode_on(&self) -> Result<bool> {
        self.session.vacation_mode_on(&self.id).await
    }

    pub async fn vacation_mode_off(&self) -> Result<bool> {
        self.session.vacation_mode_off(&self.id).await
    }

    /// Value of the first attribute named `key`.
    pub fn get_attr(&self, key: &str) -> Result<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
            .ok_or_else(|| NiceGoError::AttributeNotFound(key.to_string()))
    }
}

/// A device as listed by `devicesListAll`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub control_level: String,
    #[serde(default)]
    pub attr: Vec<Attribute>,
    pub state: StateRecord,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub device_id: String,
    /// JSON document, usually delivered as a string
    #[serde(default)]
    pub desired: Value,
    #[serde(default)]
    pub reported: Value,
    #[serde(default, deserialize_with = "text")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "text")]
    pub version: String,
    pub connection_state: Option<ConnectionRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub connected: bool,
    #[serde(default, deserialize_with = "text")]
    pub updated_timestamp: String,
}

/// Strings and numbers are both kept as text.
fn text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(D::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}

fn decode_document(value: Value, field: &str) -> Result<Map<String, Value>> {
    match value {
        Value::String(raw) => Ok(serde_json::from_str(&raw)?),
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(NiceGoError::api(format!(
            "Unexpected {field} state: {other}"
        ))),
    }
}

//! Device API requests
//!
//! Request bodies for the HTTPS GraphQL endpoint and the envelopes it
//! answers with. Every control operation is the same `devicesControl`
//! mutation carrying a different command document.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::device::DeviceRecord;
use crate::error::{NiceGoError, Result};

const DEVICES_LIST_ALL: &str = "query devicesListAll { devicesListAll { devices { \
id type controlLevel attr { key value } state { deviceId desired reported timestamp \
version connectionState { connected updatedTimestamp } } } } }";

const DEVICES_CONTROL: &str = "mutation devicesControl($deviceId: String!, $command: String!) { \
devicesControl(deviceId: $deviceId, command: $command) }";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQlRequest {
    #[serde(rename = "operationName")]
    pub operation_name: &'static str,
    pub query: &'static str,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub variables: Value,
}

/// Commands accepted by `devicesControl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierCommand {
    Open,
    Close,
    LightOn,
    LightOff,
    VacationModeOn,
    VacationModeOff,
}

impl BarrierCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BarrierCommand::Open => "open_barrier",
            BarrierCommand::Close => "close_barrier",
            BarrierCommand::LightOn => "light_on",
            BarrierCommand::LightOff => "light_off",
            BarrierCommand::VacationModeOn => "vacation_mode_on",
            BarrierCommand::VacationModeOff => "vacation_mode_off",
        }
    }

    /// The command document, sent as a JSON string.
    pub fn document(&self) -> Value {
        match self {
            BarrierCommand::Open => json!({ "door": "open" }),
            BarrierCommand::Close => json!({ "door": "close" }),
            BarrierCommand::LightOn => json!({ "light": "on" }),
            BarrierCommand::LightOff => json!({ "light": "off" }),
            BarrierCommand::VacationModeOn => json!({ "vcnMode": true }),
            BarrierCommand::VacationModeOff => json!({ "vcnMode": false }),
        }
    }
}

pub fn get_all_barriers() -> GraphQlRequest {
    GraphQlRequest {
        operation_name: "devicesListAll",
        query: DEVICES_LIST_ALL,
        variables: Value::Null,
    }
}

pub fn control(barrier_id: &str, command: BarrierCommand) -> GraphQlRequest {
    GraphQlRequest {
        operation_name: "devicesControl",
        query: DEVICES_CONTROL,
        variables: json!({
            "deviceId": barrier_id,
            "command": command.document().to_string(),
        }),
    }
}

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphQlError {
    #[serde(default)]
    pub message: String,
}

impl<T: DeserializeOwned> GraphQlResponse<T> {
    /// Parse a response body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// The `data` member, or an API error if the server reported errors or sent none.
    pub fn into_data(self) -> Result<T> {
        if !self.errors.is_empty() {
            let messages: Vec<&str> = self.errors.iter().map(|e| e.message.as_str()).collect();
            return Err(NiceGoError::api(messages.join("; ")));
        }
        self.data
            .ok_or_else(|| NiceGoError::api("Response contained no data"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesListAll {
    pub devices_list_all: DeviceList,
}

#[derive(Debug, Deserialize)]
pub struct DeviceList {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicesControl {
    pub devices_control: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_request_body() {
        let body = serde_json::to_value(control("barrier-1", BarrierCommand::Open)).unwrap();

        assert_eq!(body["operationName"], "devicesControl");
        assert_eq!(body["variables"]["deviceId"], "barrier-1");
        let command: Value =
            serde_json::from_str(body["variables"]["command"].as_str().unwrap()).unwrap();
        assert_eq!(command, json!({ "door": "open" }));
    }

    #[test]
    fn test_list_request_omits_variables() {
        let body = serde_json::to_value(get_all_barriers()).unwrap();
        assert!(body.get("variables").is_none());
        assert!(body["query"].as_str().unwrap().contains("devicesListAll"));
    }

    #[test]
    fn test_vacation_commands() {
        assert_eq!(
            BarrierCommand::VacationModeOn.document(),
            json!({ "vcnMode": true })
        );
        assert_eq!(
            BarrierCommand::VacationModeOff.document(),
            json!({ "vcnMode": false })
        );
        assert_eq!(BarrierCommand::VacationModeOff.name(), "vacation_mode_off");
    }

    #[test]
    fn test_errors_become_api_error() {
        let response: GraphQlResponse<DevicesControl> = GraphQlResponse::from_slice(
            br#"{"data": null, "errors": [{"message": "Unauthorized"}, {"message": "again"}]}"#,
        )
        .unwrap();

        let err = response.into_data().unwrap_err();
        assert!(matches!(err, NiceGoError::Api { ref message, .. } if message == "Unauthorized; again"));
    }

    #[test]
    fn test_control_data() {
        let response: GraphQlResponse<DevicesControl> =
            GraphQlResponse::from_slice(br#"{"data": {"devicesControl": true}}"#).unwrap();
        assert!(response.into_data().unwrap().devices_control);
    }

    #[test]
    fn test_missing_data() {
        let response: GraphQlResponse<DevicesControl> =
            GraphQlResponse::from_slice(br#"{}"#).unwrap();
        assert!(matches!(response.into_data(), Err(NiceGoError::Api { .. })));
    }
}

//! Wire id ↔ message type mapping.
//!
//! The native API identifies messages by a small integer in the frame
//! header. [`Request`] covers everything a client may send (ids marked
//! client-sourced or both-sourced in the schema) and decodes by an explicit,
//! statically exhaustive table; an id outside the table is a hard error that
//! closes the connection. [`Response`] covers everything the node may send
//! and maps each concrete message back to its id.

use crate::api::proto;
use crate::error::{Error, Result};
use prost::Message;

/// A decoded client → server message.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Hello(proto::HelloRequest),
    Connect(proto::ConnectRequest),
    Disconnect(proto::DisconnectRequest),
    DisconnectResponse(proto::DisconnectResponse),
    Ping(proto::PingRequest),
    PingResponse(proto::PingResponse),
    DeviceInfo(proto::DeviceInfoRequest),
    ListEntities(proto::ListEntitiesRequest),
    SubscribeStates(proto::SubscribeStatesRequest),
    SubscribeLogs(proto::SubscribeLogsRequest),
    CoverCommand(proto::CoverCommandRequest),
    FanCommand(proto::FanCommandRequest),
    LightCommand(proto::LightCommandRequest),
    SwitchCommand(proto::SwitchCommandRequest),
    SubscribeHomeassistantServices(proto::SubscribeHomeassistantServicesRequest),
    GetTime(proto::GetTimeRequest),
    GetTimeResponse(proto::GetTimeResponse),
    SubscribeHomeAssistantStates(proto::SubscribeHomeAssistantStatesRequest),
    HomeAssistantState(proto::HomeAssistantStateResponse),
    ExecuteService(proto::ExecuteServiceRequest),
    CameraImage(proto::CameraImageRequest),
    ClimateCommand(proto::ClimateCommandRequest),
}

impl Request {
    /// Decode the payload for a wire id.
    ///
    /// Unknown ids are not tolerated: the id table is the protocol contract,
    /// and a client sending outside it is talking a different version.
    pub fn decode(id: u32, payload: &[u8]) -> Result<Request> {
        Ok(match id {
            1 => Request::Hello(proto::HelloRequest::decode(payload)?),
            3 => Request::Connect(proto::ConnectRequest::decode(payload)?),
            5 => Request::Disconnect(proto::DisconnectRequest::decode(payload)?),
            6 => Request::DisconnectResponse(proto::DisconnectResponse::decode(payload)?),
            7 => Request::Ping(proto::PingRequest::decode(payload)?),
            8 => Request::PingResponse(proto::PingResponse::decode(payload)?),
            9 => Request::DeviceInfo(proto::DeviceInfoRequest::decode(payload)?),
            11 => Request::ListEntities(proto::ListEntitiesRequest::decode(payload)?),
            20 => Request::SubscribeStates(proto::SubscribeStatesRequest::decode(payload)?),
            28 => Request::SubscribeLogs(proto::SubscribeLogsRequest::decode(payload)?),
            30 => Request::CoverCommand(proto::CoverCommandRequest::decode(payload)?),
            31 => Request::FanCommand(proto::FanCommandRequest::decode(payload)?),
            32 => Request::LightCommand(proto::LightCommandRequest::decode(payload)?),
            33 => Request::SwitchCommand(proto::SwitchCommandRequest::decode(payload)?),
            34 => Request::SubscribeHomeassistantServices(
                proto::SubscribeHomeassistantServicesRequest::decode(payload)?,
            ),
            36 => Request::GetTime(proto::GetTimeRequest::decode(payload)?),
            37 => Request::GetTimeResponse(proto::GetTimeResponse::decode(payload)?),
            38 => Request::SubscribeHomeAssistantStates(
                proto::SubscribeHomeAssistantStatesRequest::decode(payload)?,
            ),
            // Reverse of the usual naming convention: flows client → server.
            40 => Request::HomeAssistantState(proto::HomeAssistantStateResponse::decode(payload)?),
            42 => Request::ExecuteService(proto::ExecuteServiceRequest::decode(payload)?),
            45 => Request::CameraImage(proto::CameraImageRequest::decode(payload)?),
            48 => Request::ClimateCommand(proto::ClimateCommandRequest::decode(payload)?),
            other => return Err(Error::UnsupportedMessage(other)),
        })
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello(_) => "HelloRequest",
            Request::Connect(_) => "ConnectRequest",
            Request::Disconnect(_) => "DisconnectRequest",
            Request::DisconnectResponse(_) => "DisconnectResponse",
            Request::Ping(_) => "PingRequest",
            Request::PingResponse(_) => "PingResponse",
            Request::DeviceInfo(_) => "DeviceInfoRequest",
            Request::ListEntities(_) => "ListEntitiesRequest",
            Request::SubscribeStates(_) => "SubscribeStatesRequest",
            Request::SubscribeLogs(_) => "SubscribeLogsRequest",
            Request::CoverCommand(_) => "CoverCommandRequest",
            Request::FanCommand(_) => "FanCommandRequest",
            Request::LightCommand(_) => "LightCommandRequest",
            Request::SwitchCommand(_) => "SwitchCommandRequest",
            Request::SubscribeHomeassistantServices(_) => "SubscribeHomeassistantServicesRequest",
            Request::GetTime(_) => "GetTimeRequest",
            Request::GetTimeResponse(_) => "GetTimeResponse",
            Request::SubscribeHomeAssistantStates(_) => "SubscribeHomeAssistantStatesRequest",
            Request::HomeAssistantState(_) => "HomeAssistantStateResponse",
            Request::ExecuteService(_) => "ExecuteServiceRequest",
            Request::CameraImage(_) => "CameraImageRequest",
            Request::ClimateCommand(_) => "ClimateCommandRequest",
        }
    }
}

/// A server → client message, paired with its wire id.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Hello(proto::HelloResponse),
    Connect(proto::ConnectResponse),
    DisconnectRequest(proto::DisconnectRequest),
    DisconnectResponse(proto::DisconnectResponse),
    PingRequest(proto::PingRequest),
    Ping(proto::PingResponse),
    DeviceInfo(proto::DeviceInfoResponse),
    ListEntitiesBinarySensor(proto::ListEntitiesBinarySensorResponse),
    ListEntitiesCover(proto::ListEntitiesCoverResponse),
    ListEntitiesFan(proto::ListEntitiesFanResponse),
    ListEntitiesLight(proto::ListEntitiesLightResponse),
    ListEntitiesSensor(proto::ListEntitiesSensorResponse),
    ListEntitiesSwitch(proto::ListEntitiesSwitchResponse),
    ListEntitiesTextSensor(proto::ListEntitiesTextSensorResponse),
    ListEntitiesDone(proto::ListEntitiesDoneResponse),
    BinarySensorState(proto::BinarySensorStateResponse),
    CoverState(proto::CoverStateResponse),
    FanState(proto::FanStateResponse),
    LightState(proto::LightStateResponse),
    SensorState(proto::SensorStateResponse),
    SwitchState(proto::SwitchStateResponse),
    TextSensorState(proto::TextSensorStateResponse),
    SubscribeLogs(proto::SubscribeLogsResponse),
    HomeassistantService(proto::HomeassistantServiceResponse),
    GetTimeRequest(proto::GetTimeRequest),
    GetTime(proto::GetTimeResponse),
    SubscribeHomeAssistantState(proto::SubscribeHomeAssistantStateResponse),
    ListEntitiesServices(proto::ListEntitiesServicesResponse),
    ListEntitiesCamera(proto::ListEntitiesCameraResponse),
    CameraImage(proto::CameraImageResponse),
    ListEntitiesClimate(proto::ListEntitiesClimateResponse),
    ClimateState(proto::ClimateStateResponse),
}

impl Response {
    /// The wire id this message is framed with.
    pub fn wire_id(&self) -> u32 {
        match self {
            Response::Hello(_) => 2,
            Response::Connect(_) => 4,
            Response::DisconnectRequest(_) => 5,
            Response::DisconnectResponse(_) => 6,
            Response::PingRequest(_) => 7,
            Response::Ping(_) => 8,
            Response::DeviceInfo(_) => 10,
            Response::ListEntitiesBinarySensor(_) => 12,
            Response::ListEntitiesCover(_) => 13,
            Response::ListEntitiesFan(_) => 14,
            Response::ListEntitiesLight(_) => 15,
            Response::ListEntitiesSensor(_) => 16,
            Response::ListEntitiesSwitch(_) => 17,
            Response::ListEntitiesTextSensor(_) => 18,
            Response::ListEntitiesDone(_) => 19,
            Response::BinarySensorState(_) => 21,
            Response::CoverState(_) => 22,
            Response::FanState(_) => 23,
            Response::LightState(_) => 24,
            Response::SensorState(_) => 25,
            Response::SwitchState(_) => 26,
            Response::TextSensorState(_) => 27,
            Response::SubscribeLogs(_) => 29,
            Response::HomeassistantService(_) => 35,
            Response::GetTimeRequest(_) => 36,
            Response::GetTime(_) => 37,
            Response::SubscribeHomeAssistantState(_) => 39,
            Response::ListEntitiesServices(_) => 41,
            Response::ListEntitiesCamera(_) => 43,
            Response::CameraImage(_) => 44,
            Response::ListEntitiesClimate(_) => 46,
            Response::ClimateState(_) => 47,
        }
    }

    /// Serialize the message body.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Response::Hello(m) => m.encode_to_vec(),
            Response::Connect(m) => m.encode_to_vec(),
            Response::DisconnectRequest(m) => m.encode_to_vec(),
            Response::DisconnectResponse(m) => m.encode_to_vec(),
            Response::PingRequest(m) => m.encode_to_vec(),
            Response::Ping(m) => m.encode_to_vec(),
            Response::DeviceInfo(m) => m.encode_to_vec(),
            Response::ListEntitiesBinarySensor(m) => m.encode_to_vec(),
            Response::ListEntitiesCover(m) => m.encode_to_vec(),
            Response::ListEntitiesFan(m) => m.encode_to_vec(),
            Response::ListEntitiesLight(m) => m.encode_to_vec(),
            Response::ListEntitiesSensor(m) => m.encode_to_vec(),
            Response::ListEntitiesSwitch(m) => m.encode_to_vec(),
            Response::ListEntitiesTextSensor(m) => m.encode_to_vec(),
            Response::ListEntitiesDone(m) => m.encode_to_vec(),
            Response::BinarySensorState(m) => m.encode_to_vec(),
            Response::CoverState(m) => m.encode_to_vec(),
            Response::FanState(m) => m.encode_to_vec(),
            Response::LightState(m) => m.encode_to_vec(),
            Response::SensorState(m) => m.encode_to_vec(),
            Response::SwitchState(m) => m.encode_to_vec(),
            Response::TextSensorState(m) => m.encode_to_vec(),
            Response::SubscribeLogs(m) => m.encode_to_vec(),
            Response::HomeassistantService(m) => m.encode_to_vec(),
            Response::GetTimeRequest(m) => m.encode_to_vec(),
            Response::GetTime(m) => m.encode_to_vec(),
            Response::SubscribeHomeAssistantState(m) => m.encode_to_vec(),
            Response::ListEntitiesServices(m) => m.encode_to_vec(),
            Response::ListEntitiesCamera(m) => m.encode_to_vec(),
            Response::CameraImage(m) => m.encode_to_vec(),
            Response::ListEntitiesClimate(m) => m.encode_to_vec(),
            Response::ClimateState(m) => m.encode_to_vec(),
        }
    }
}

//! Logical command and event contract with the external player, and its
//! mpv JSON IPC encoding.

use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::audio::error::PlayerError;

/// Properties observed on every process start.
pub const OBSERVED_PROPERTIES: [&str; 7] = [
    "time-pos",
    "duration",
    "pause",
    "volume",
    "speed",
    "idle-active",
    "eof-reached",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    LoadFile { url: String },
    SetProperty { name: String, value: Value },
    GetProperty { name: String },
    ObserveProperty { id: u64, name: String },
    Seek { seconds: f64 },
    Stop,
    Quit,
}

impl Request {
    pub fn set(name: &str, value: Value) -> Self {
        Request::SetProperty {
            name: name.to_string(),
            value,
        }
    }

    /// `volume` is in the shared `0..=1` range.
    pub fn set_volume(volume: f32) -> Self {
        Self::set("volume", json!((volume as f64 * 100.0).round()))
    }

    pub fn set_speed(speed: f32) -> Self {
        Self::set("speed", json!(speed))
    }

    pub fn set_pause(paused: bool) -> Self {
        Self::set("pause", json!(paused))
    }

    pub fn set_loop(looping: bool) -> Self {
        Self::set("loop-file", json!(if looping { "inf" } else { "no" }))
    }

    pub fn set_headers(headers: &BTreeMap<String, String>) -> Self {
        let fields: Vec<String> = headers
            .iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect();
        Self::set("http-header-fields", json!(fields))
    }

    pub fn set_user_agent(user_agent: &str) -> Self {
        Self::set("user-agent", json!(user_agent))
    }

    pub fn set_audio_device(device: &str) -> Self {
        Self::set("audio-device", json!(device))
    }

    fn command(&self) -> Value {
        match self {
            Request::LoadFile { url } => json!(["loadfile", url, "replace"]),
            Request::SetProperty { name, value } => json!(["set_property", name, value]),
            Request::GetProperty { name } => json!(["get_property", name]),
            Request::ObserveProperty { id, name } => json!(["observe_property", id, name]),
            Request::Seek { seconds } => json!(["seek", seconds, "absolute"]),
            Request::Stop => json!(["stop"]),
            Request::Quit => json!(["quit"]),
        }
    }

    /// One line of mpv JSON IPC, newline included.
    pub fn encode(&self, request_id: u64) -> String {
        let mut line = json!({ "command": self.command(), "request_id": request_id }).to_string();
        line.push('\n');
        line
    }
}

/// A property update, already normalised to shared units.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    TimePos(f64),
    Duration(f64),
    Pause(bool),
    Volume(f32),
    Speed(f32),
    IdleActive(bool),
    EofReached(bool),
}

impl Property {
    /// `None` for unknown names and for values mpv reports as unavailable.
    pub fn from_raw(name: &str, data: &Value) -> Option<Self> {
        match name {
            "time-pos" => data.as_f64().map(Property::TimePos),
            "duration" => Some(Property::Duration(data.as_f64().unwrap_or(f64::INFINITY))),
            "pause" => data.as_bool().map(Property::Pause),
            "volume" => data
                .as_f64()
                .map(|v| Property::Volume((v / 100.0).clamp(0.0, 1.0) as f32)),
            "speed" => data.as_f64().map(|v| Property::Speed(v as f32)),
            "idle-active" => data.as_bool().map(Property::IdleActive),
            "eof-reached" => data.as_bool().map(Property::EofReached),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Stop,
    Quit,
    Error(String),
    Other(String),
}

/// What the host side reports about the external process.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessSignal {
    Property(Property),
    /// The requested file is loaded and playback can begin.
    Started,
    /// Playback stopped for a reason other than reaching the end.
    Stopped(StopReason),
    Exited { code: Option<i32> },
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    event: Option<String>,
    name: Option<String>,
    #[serde(default)]
    data: Value,
    request_id: Option<u64>,
    error: Option<String>,
    reason: Option<String>,
    file_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response {
        request_id: u64,
        result: Result<Value, String>,
    },
    Signal(ProcessSignal),
    Ignored,
}

pub fn decode(line: &str) -> Result<Message, PlayerError> {
    let raw: RawMessage = serde_json::from_str(line)?;

    if let Some(event) = raw.event.as_deref() {
        let signal = match event {
            "property-change" => raw
                .name
                .as_deref()
                .and_then(|name| Property::from_raw(name, &raw.data))
                .map(ProcessSignal::Property),
            "file-loaded" => Some(ProcessSignal::Started),
            "end-file" => Some(match raw.reason.as_deref() {
                Some("eof") => ProcessSignal::Property(Property::EofReached(true)),
                Some("stop") | Some("redirect") => ProcessSignal::Stopped(StopReason::Stop),
                Some("quit") => ProcessSignal::Stopped(StopReason::Quit),
                Some("error") => ProcessSignal::Stopped(StopReason::Error(
                    raw.file_error.unwrap_or_else(|| "unknown error".to_string()),
                )),
                other => ProcessSignal::Stopped(StopReason::Other(
                    other.unwrap_or_default().to_string(),
                )),
            }),
            _ => None,
        };
        return Ok(signal.map_or(Message::Ignored, Message::Signal));
    }

    if let Some(request_id) = raw.request_id {
        let result = match raw.error.as_deref() {
            None | Some("success") => Ok(raw.data),
            Some(err) => Err(err.to_string()),
        };
        return Ok(Message::Response { request_id, result });
    }

    Ok(Message::Ignored)
}

// src/events/model.rs

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Asks the search service for a track on behalf of a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTrackRequest {
    pub request_id: String,
    pub name: String,
}

/// The search service's answer, correlated by `request_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTrackResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_flag",
        deserialize_with = "deserialize_flag"
    )]
    pub success: Option<bool>,
    #[serde(rename = "err", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SearchTrackResponse {
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn succeeded(&self) -> bool {
        self.success == Some(true)
    }

    /// Text sent back to the chat: the track name on success, `failure` otherwise.
    pub fn reply_text<'a>(&'a self, failure: &'a str) -> &'a str {
        match (&self.name, self.succeeded()) {
            (Some(name), true) if !name.is_empty() => name.as_str(),
            _ => failure,
        }
    }
}

/// Which payload a queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTrackEvent {
    Request(SearchTrackRequest),
    Response(SearchTrackResponse),
}

impl SearchTrackEvent {
    /// Decodes `body` as the payload kind its queue carries.
    pub fn decode(kind: EventKind, body: &[u8]) -> Result<Self, DecodeError> {
        Ok(match kind {
            EventKind::Request => SearchTrackEvent::Request(serde_json::from_slice(body)?),
            EventKind::Response => SearchTrackEvent::Response(SearchTrackResponse::decode(body)?),
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            SearchTrackEvent::Request(_) => EventKind::Request,
            SearchTrackEvent::Response(_) => EventKind::Response,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            SearchTrackEvent::Request(request) => serde_json::to_vec(request),
            SearchTrackEvent::Response(response) => serde_json::to_vec(response),
        }
    }
}

// The wire carries `success` as the string "true"/"false"; plain booleans are accepted too.
fn serialize_flag<S: Serializer>(value: &Option<bool>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(flag) => serializer.serialize_str(if *flag { "true" } else { "false" }),
        None => serializer.serialize_none(),
    }
}

fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(flag)) => Some(flag),
        Some(Flag::Text(text)) => Some(text == "true"),
        None => None,
    })
}

//! Protocol constants, push-event kinds and channel projection types.

use serde::{Deserialize, Serialize};

/// HTSP protocol version announced in `hello`.
pub const HTSP_VERSION: i64 = 20;

/// Default HTSP port of the backend.
pub const DEFAULT_HTSP_PORT: u16 = 9982;

/// Size of the big-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame body size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Field type tags.
pub const TYPE_MAP: u8 = 1;
pub const TYPE_S64: u8 = 2;
pub const TYPE_STR: u8 = 3;
pub const TYPE_BIN: u8 = 4;
pub const TYPE_LIST: u8 = 5;

pub const FIELD_METHOD: &str = "method";
pub const FIELD_SEQ: &str = "seq";

/// Request methods used by the client.
pub mod method {
    pub const HELLO: &str = "hello";
    pub const AUTHENTICATE: &str = "authenticate";
    pub const ENABLE_ASYNC_METADATA: &str = "enableAsyncMetadata";
    pub const GET_EVENTS: &str = "getEvents";
    pub const GET_TICKET: &str = "getTicket";
    pub const ADD_DVR_ENTRY: &str = "addDvrEntry";
    pub const CANCEL_DVR_ENTRY: &str = "cancelDvrEntry";
    pub const DELETE_DVR_ENTRY: &str = "deleteDvrEntry";
}

/// Channel record field names.
pub mod channel_field {
    pub const ID: &str = "channelId";
    pub const NUMBER: &str = "channelNumber";
    pub const NUMBER_MINOR: &str = "channelNumberMinor";
    pub const NAME: &str = "channelName";
    pub const ICON: &str = "channelIcon";
    pub const SERVICES: &str = "services";
    pub const SERVICE_TYPE: &str = "type";
}

/// Kind of an unsolicited server message, keyed by its `method`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    TagAdd,
    TagUpdate,
    TagDelete,
    ChannelAdd,
    ChannelUpdate,
    EventAdd,
    EventUpdate,
    EventDelete,
    /// The server finished sending the baseline after `enableAsyncMetadata`.
    InitialSyncCompleted,
    /// Any method the client does not act on.
    Other(String),
}

impl PushEvent {
    pub fn from_method(method: &str) -> Self {
        match method {
            "tagAdd" => PushEvent::TagAdd,
            "tagUpdate" => PushEvent::TagUpdate,
            "tagDelete" => PushEvent::TagDelete,
            "channelAdd" => PushEvent::ChannelAdd,
            "channelUpdate" => PushEvent::ChannelUpdate,
            "eventAdd" => PushEvent::EventAdd,
            "eventUpdate" => PushEvent::EventUpdate,
            "eventDelete" => PushEvent::EventDelete,
            "initialSyncCompleted" => PushEvent::InitialSyncCompleted,
            other => PushEvent::Other(other.to_string()),
        }
    }
}

/// Tunable channel classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    Tv,
    Radio,
}

impl ChannelType {
    /// Classify a service type tag such as `"HDTV"` or `"Radio"`.
    ///
    /// Returns `None` for tags that cannot be tuned.
    pub fn from_service_type(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "radio" => Some(ChannelType::Radio),
            "sdtv" | "hdtv" | "uhdtv" | "fhdtv" => Some(ChannelType::Tv),
            _ => None,
        }
    }
}

/// Channel as presented to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Server channel id, as a string.
    pub id: String,
    pub name: String,
    /// `"{major}"` or `"{major}.{minor}"`.
    pub number: String,
    /// Absolute `http://` icon URL, if the server sent one.
    pub image_url: Option<String>,
    pub channel_type: ChannelType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_event_from_method() {
        assert_eq!(PushEvent::from_method("channelAdd"), PushEvent::ChannelAdd);
        assert_eq!(
            PushEvent::from_method("initialSyncCompleted"),
            PushEvent::InitialSyncCompleted
        );
        assert_eq!(
            PushEvent::from_method("queueStatus"),
            PushEvent::Other("queueStatus".to_string())
        );
    }

    #[test]
    fn test_service_type_classification() {
        assert_eq!(ChannelType::from_service_type("HDTV"), Some(ChannelType::Tv));
        assert_eq!(ChannelType::from_service_type("uhdtv"), Some(ChannelType::Tv));
        assert_eq!(ChannelType::from_service_type("Radio"), Some(ChannelType::Radio));
        assert_eq!(ChannelType::from_service_type("teletext"), None);
        assert_eq!(ChannelType::from_service_type(""), None);
    }
}

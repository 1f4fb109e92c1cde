//! CloudEvents 1.0 envelopes and inbound event routing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BoxError, ClientErrorCode, UimError};
use crate::request::JSON;

/// The only CloudEvents version produced and accepted.
pub const SPEC_VERSION: &str = "1.0";

/// Event types exchanged between the platform and providers.
pub mod types {
    pub const PROVIDER_NEW_ACCOUNT: &str = "provider.new_account";
    pub const PROVIDER_ACCOUNT_UPDATED: &str = "provider.account_updated";
    pub const PROVIDER_NEW_FRIEND_APPLY: &str = "provider.new_friend_apply";
    pub const PROVIDER_NEW_CONTACT: &str = "provider.new_contact";
    pub const PROVIDER_CONTACT_UPDATED: &str = "provider.contact_updated";
    pub const PROVIDER_NEW_GROUP: &str = "provider.new_group";
    pub const PROVIDER_GROUP_UPDATED: &str = "provider.group_updated";
    pub const PROVIDER_NEW_GROUP_MEMBER: &str = "provider.new_group_member";
    pub const PROVIDER_NEW_CONVERSATION: &str = "provider.new_conversation";
    pub const PROVIDER_NEW_MESSAGE: &str = "provider.new_message";
    pub const PROVIDER_MESSAGE_UPDATED: &str = "provider.message_updated";
    pub const PROVIDER_NEW_MOMENT: &str = "provider.new_moment";

    pub const UIM_SEND_MESSAGE: &str = "uim.send_message";
    pub const UIM_ADD_CONTACT: &str = "uim.add_contact";
    pub const UIM_APPLY_FRIEND: &str = "uim.apply_friend";
    pub const UIM_NEW_GROUP: &str = "uim.new_group";
    pub const UIM_INVITE_TO_GROUP: &str = "uim.invite_to_group";
    pub const UIM_PUBLISH_MOMENT: &str = "uim.publish_moment";
}

/// CloudEvents 1.0 envelope in structured JSON mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    pub specversion: String,
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CloudEvent {
    /// New event with a random id, the current time and JSON `data`.
    ///
    /// # Errors
    ///
    /// Returns `SDK.JsonMarshalError` if `data` does not serialize.
    pub fn new<T: Serialize + ?Sized>(
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: &T,
    ) -> Result<Self, UimError> {
        let data = serde_json::to_value(data).map_err(UimError::json_marshal)?;
        Ok(Self {
            specversion: SPEC_VERSION.to_owned(),
            id: nanoid::nanoid!(),
            source: source.into(),
            event_type: event_type.into(),
            datacontenttype: Some(JSON.to_owned()),
            time: Some(OffsetDateTime::now_utc()),
            data: Some(data),
        })
    }

    /// Parse a structured-mode JSON event.
    ///
    /// # Errors
    ///
    /// Returns `SDK.JsonUnmarshalError` for malformed JSON, a missing
    /// required attribute or a `specversion` other than `1.0`.
    pub fn from_slice(body: &[u8]) -> Result<Self, UimError> {
        let event: Self = serde_json::from_slice(body).map_err(|e| {
            UimError::client_with_source(
                ClientErrorCode::JsonUnmarshal,
                format!("Failed to unmarshal event: {e}"),
                e,
            )
        })?;
        if event.specversion != SPEC_VERSION {
            return Err(UimError::client(
                ClientErrorCode::JsonUnmarshal,
                format!("Unsupported event specversion '{}'", event.specversion),
            ));
        }
        Ok(event)
    }

    /// Decode `data` into `T`; a missing payload decodes as JSON `null`.
    ///
    /// # Errors
    ///
    /// Returns `SDK.JsonUnmarshalError` if the payload does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, UimError> {
        let data = self.data.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(|e| {
            UimError::client_with_source(
                ClientErrorCode::JsonUnmarshal,
                format!("Failed to unmarshal data of event '{}': {e}", self.event_type),
                e,
            )
        })
    }
}

/// Handler of one inbound event type.
pub type EventHandler = Arc<dyn Fn(&CloudEvent) -> Result<(), BoxError> + Send + Sync>;

/// Handlers by event type; handlers of a type run in registration order.
#[derive(Clone, Default)]
pub struct EventRouter {
    handlers: HashMap<String, Vec<EventHandler>>,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("EventRouter")
            .field("event_types", &types)
            .finish()
    }
}

impl EventRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&CloudEvent) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    #[must_use]
    pub fn handlers_for(&self, event_type: &str) -> Vec<EventHandler> {
        self.handlers.get(event_type).cloned().unwrap_or_default()
    }

    /// Run every handler of the event's type, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// - `SDK.UnsupportedEventType` when no handler is registered
    /// - `SDK.ClientError` wrapping the first handler failure
    pub fn dispatch(&self, event: &CloudEvent) -> Result<(), UimError> {
        run_handlers(&self.handlers_for(&event.event_type), event)
    }
}

pub(crate) fn run_handlers(handlers: &[EventHandler], event: &CloudEvent) -> Result<(), UimError> {
    if handlers.is_empty() {
        return Err(UimError::client(
            ClientErrorCode::UnsupportedEventType,
            format!("No handler registered for event type '{}'", event.event_type),
        ));
    }
    for handler in handlers {
        handler(event).map_err(|e| {
            UimError::client_with_source(
                ClientErrorCode::ClientError,
                format!("Handler for event '{}' failed", event.event_type),
                e,
            )
        })?;
    }
    Ok(())
}

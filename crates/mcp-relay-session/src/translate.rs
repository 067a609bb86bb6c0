//! Wire frame ⇄ normalized message translation.
//!
//! Inbound frames keep the manager-assigned uuid so replays stay
//! idempotent; outbound-originated messages get a fresh time-ordered
//! uuid. Any caller-chosen id is mapped through the session's unified
//! identity so responses route back to the original caller even after a
//! recreation changed the processing run.

use serde_json::Value;
use uuid::Uuid;

use mcp_relay_core::UnifiedIdentity;
use mcp_relay_core::model::{MessageKind, Participant, ProtocolMessage};
use mcp_relay_core::rpc::WireMessage;

/// Per-session message translator.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageTranslator {
    identity: UnifiedIdentity,
}

impl MessageTranslator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            identity: UnifiedIdentity::new(),
        }
    }

    /// Normalize a frame received from a manager stream.
    ///
    /// A response or error echoing an id this translator minted is routed
    /// back: the message carries the original caller as sender and the
    /// caller's own id, not a server-side re-wrap.
    #[must_use]
    pub fn decode(&self, wire: &WireMessage, sender: Participant) -> ProtocolMessage {
        let kind = MessageKind::from_code(wire.kind_code);
        if matches!(kind, MessageKind::Response | MessageKind::Error) {
            if let Some((caller, original)) = wire
                .id
                .as_ref()
                .and_then(Value::as_str)
                .and_then(|id| self.identity.deserialize(id))
            {
                return ProtocolMessage {
                    uuid: wire.uuid.unwrap_or_else(Uuid::now_v7),
                    kind,
                    method: wire.method.clone(),
                    payload: wire.payload.clone(),
                    sender: caller,
                    original_id: Some(original),
                    unified_id: wire.id.as_ref().and_then(Value::as_str).map(str::to_owned),
                };
            }
        }
        let unified_id = wire
            .id
            .as_ref()
            .map(|id| self.identity.serialize(&sender, id));
        ProtocolMessage {
            uuid: wire.uuid.unwrap_or_else(Uuid::now_v7),
            kind,
            method: wire.method.clone(),
            payload: wire.payload.clone(),
            sender,
            original_id: wire.id.clone(),
            unified_id,
        }
    }

    /// Normalize an outbound frame to be forwarded to the manager.
    #[must_use]
    pub fn outbound(&self, frame: &WireMessage, sender: Participant) -> ProtocolMessage {
        let unified_id = frame
            .id
            .as_ref()
            .map(|id| self.identity.serialize(&sender, id));
        ProtocolMessage {
            uuid: Uuid::now_v7(),
            kind: MessageKind::from_code(frame.kind_code),
            method: frame.method.clone(),
            payload: frame.payload.clone(),
            sender,
            original_id: frame.id.clone(),
            unified_id,
        }
    }

    /// Encode a normalized message for the manager, substituting the
    /// unified id for the sender-chosen one.
    #[must_use]
    pub fn encode(&self, message: &ProtocolMessage) -> WireMessage {
        WireMessage {
            uuid: Some(message.uuid),
            kind_code: message.kind.code(),
            method: message.method.clone(),
            id: message
                .unified_id
                .as_ref()
                .map(|unified| Value::String(unified.clone()))
                .or_else(|| message.original_id.clone()),
            payload: message.payload.clone(),
            run_id: None,
        }
    }

    /// Resolve a unified id back to its original sender and id.
    #[must_use]
    pub fn route_back(&self, unified_id: &str) -> Option<(Participant, Value)> {
        self.identity.deserialize(unified_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_frame(id: Value) -> WireMessage {
        WireMessage {
            uuid: None,
            kind_code: 0,
            method: Some("tools/call".to_string()),
            id: Some(id),
            payload: json!({"name": "echo"}),
            run_id: None,
        }
    }

    #[test]
    fn inbound_frames_keep_the_manager_uuid() {
        let translator = MessageTranslator::new();
        let uuid = Uuid::now_v7();
        let wire = WireMessage {
            uuid: Some(uuid),
            kind_code: 2,
            method: Some("notifications/progress".to_string()),
            id: None,
            payload: json!({"progress": 0.5}),
            run_id: Some("run-1".to_string()),
        };

        let message = translator.decode(&wire, Participant::server("run-1"));
        assert_eq!(message.uuid, uuid);
        assert_eq!(message.kind, MessageKind::Notification);
        assert!(message.unified_id.is_none());
    }

    #[test]
    fn outbound_messages_get_fresh_uuids_and_unified_ids() {
        let translator = MessageTranslator::new();
        let sender = Participant::client("conn-1");

        let first = translator.outbound(&request_frame(json!(1)), sender.clone());
        let second = translator.outbound(&request_frame(json!(1)), sender.clone());
        assert_ne!(first.uuid, second.uuid);

        let unified = first.unified_id.clone().unwrap();
        let (participant, original) = translator.route_back(&unified).unwrap();
        assert_eq!(participant, sender);
        assert_eq!(original, json!(1));
    }

    #[test]
    fn encode_substitutes_the_unified_id() {
        let translator = MessageTranslator::new();
        let message = translator.outbound(&request_frame(json!("abc")), Participant::client("c1"));

        let wire = translator.encode(&message);
        assert_eq!(wire.uuid, Some(message.uuid));
        assert_eq!(wire.kind_code, 0);
        let sent_id = wire.id.unwrap();
        assert_ne!(sent_id, json!("abc"));
        let (_, original) = translator
            .route_back(sent_id.as_str().unwrap())
            .unwrap();
        assert_eq!(original, json!("abc"));
    }

    #[test]
    fn responses_echoing_a_relayed_id_route_back_to_the_caller() {
        let translator = MessageTranslator::new();
        let caller = Participant::client("conn-1");
        let request = translator.outbound(&request_frame(json!(7)), caller.clone());
        let relayed = translator.encode(&request);

        let response = WireMessage {
            uuid: Some(Uuid::now_v7()),
            kind_code: 1,
            method: None,
            id: relayed.id.clone(),
            payload: json!({"ok": true}),
            run_id: Some("run-1".to_string()),
        };
        let message = translator.decode(&response, Participant::server("run-1"));
        assert_eq!(message.sender, caller);
        assert_eq!(message.original_id, Some(json!(7)));
        assert_eq!(
            message.unified_id.as_deref(),
            relayed.id.as_ref().and_then(Value::as_str)
        );
    }

    #[test]
    fn concurrent_runs_never_collide_on_relayed_ids() {
        let translator = MessageTranslator::new();
        let frame = request_frame(json!(9));
        let from_run_a = translator.decode(&frame, Participant::server("run-a"));
        let from_run_b = translator.decode(&frame, Participant::server("run-b"));
        assert_ne!(from_run_a.unified_id, from_run_b.unified_id);
    }
}

//! Per-session unified message identity.
//!
//! Ids chosen independently by the client and by possibly-multiple
//! concurrent remote runs must never collide when relayed through one
//! session. The unified id embeds the sender participant, so a response
//! can be routed back to the original caller even when the run that
//! processed it differs between attempts.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD as B64};
use serde_json::Value;

use crate::model::{Participant, ParticipantRole};

/// Per-session serialization of `(participant, original_id)` to an opaque
/// id and back.
///
/// Wire shape: `{role}:{b64(scope)}:{b64(json(original_id))}`. Distinct
/// participants can never produce the same unified id for any original id,
/// and JSON-encoding the original preserves string-vs-number JSON-RPC ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnifiedIdentity;

impl UnifiedIdentity {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Map a participant-chosen id to the session-unique opaque id.
    #[must_use]
    pub fn serialize(&self, participant: &Participant, original_id: &Value) -> String {
        let role = match participant.role {
            ParticipantRole::Client => "c",
            ParticipantRole::Server => "s",
        };
        let scope = B64.encode(participant.scope_id.as_bytes());
        let id = B64.encode(original_id.to_string().as_bytes());
        format!("{role}:{scope}:{id}")
    }

    /// Reverse [`Self::serialize`]. Returns `None` for ids not produced by
    /// this scheme.
    #[must_use]
    pub fn deserialize(&self, unified: &str) -> Option<(Participant, Value)> {
        let mut parts = unified.splitn(3, ':');
        let role = match parts.next()? {
            "c" => ParticipantRole::Client,
            "s" => ParticipantRole::Server,
            _ => return None,
        };
        let scope = String::from_utf8(B64.decode(parts.next()?).ok()?).ok()?;
        let raw = B64.decode(parts.next()?).ok()?;
        let original_id: Value = serde_json::from_slice(&raw).ok()?;
        Some((
            Participant {
                role,
                scope_id: scope,
            },
            original_id,
        ))
    }
}

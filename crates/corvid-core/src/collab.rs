//! External collaborator seams. The gateway never issues credentials,
//! evaluates room ACLs or owns a storage engine; it consumes these
//! capabilities through the traits below. The bundled implementations
//! cover single-instance deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use corvid_models::message::{FanoutMessage, MessageOp};
use corvid_models::room::RoomId;

use crate::error::{GatewayError, Result};
use crate::registry::UserId;

/// Validates the credential presented during IDENTIFY and yields the
/// authenticated user. Verification itself (issuance, revocation) lives
/// with the platform's auth service.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    exp: usize,
    iat: usize,
}

/// HMAC-signed JWT validation against the platform's shared secret.
pub struct JwtIdentityValidator {
    secret: String,
}

impl JwtIdentityValidator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }

    /// Mint a token for the given user. The gateway itself never calls
    /// this; it exists for tests and local tooling.
    pub fn issue(
        &self,
        user_id: UserId,
        expiry_secs: u64,
    ) -> std::result::Result<String, jsonwebtoken::errors::Error> {
        let now = chrono::Utc::now().timestamp() as usize;
        let claims = Claims {
            sub: user_id,
            iat: now,
            exp: now + expiry_secs as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }
}

#[async_trait]
impl IdentityValidator for JwtIdentityValidator {
    async fn verify(&self, credential: &str) -> Result<UserId> {
        decode::<Claims>(
            credential,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims.sub)
        .map_err(|_| GatewayError::Unauthenticated)
    }
}

/// Authorization check consulted on every room join.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn can_join(&self, user_id: UserId, room: &RoomId) -> bool;
}

/// Permissive checker for deployments where room ACLs are enforced
/// upstream (and for tests).
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn can_join(&self, _user_id: UserId, _room: &RoomId) -> bool {
        true
    }
}

/// Durable record keeper for accepted message operations. Delivery only
/// ever happens for records this collaborator has accepted.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, record: &FanoutMessage) -> Result<()>;
    /// The current (most recently applied) state of a message, used for
    /// authorship checks on edit/delete.
    async fn fetch(&self, message_id: &str) -> Result<Option<FanoutMessage>>;
    /// Highest sequence this store has seen for the room; seeds the
    /// room's sequencer when a reclaimed room is re-created.
    async fn last_sequence(&self, room: &RoomId) -> Result<u64>;
}

/// In-memory store for single-instance deployments and tests. Real
/// deployments point the engine at the platform's persistence service.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: DashMap<String, FanoutMessage>,
    sequences: DashMap<RoomId, u64>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, record: &FanoutMessage) -> Result<()> {
        match record.op {
            MessageOp::Create => {
                self.messages.insert(record.id.clone(), record.clone());
            }
            MessageOp::Edit => {
                if let Some(mut existing) = self.messages.get_mut(&record.id) {
                    existing.payload = record.payload.clone();
                }
            }
            MessageOp::Delete => {
                self.messages.remove(&record.id);
            }
        }
        let mut seq = self.sequences.entry(record.room.clone()).or_insert(0);
        *seq = (*seq).max(record.sequence);
        Ok(())
    }

    async fn fetch(&self, message_id: &str) -> Result<Option<FanoutMessage>> {
        Ok(self.messages.get(message_id).map(|r| r.value().clone()))
    }

    async fn last_sequence(&self, room: &RoomId) -> Result<u64> {
        Ok(self.sequences.get(room).map(|s| *s.value()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jwt_round_trip() {
        let validator = JwtIdentityValidator::new("test-secret-test-secret-test-secret");
        let token = validator.issue(42, 60).expect("issue");
        let user = validator.verify(&token).await.expect("verify");
        assert_eq!(user, 42);
    }

    #[tokio::test]
    async fn jwt_rejects_wrong_secret() {
        let issuer = JwtIdentityValidator::new("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let verifier = JwtIdentityValidator::new("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        let token = issuer.issue(42, 60).expect("issue");
        assert!(matches!(
            verifier.verify(&token).await,
            Err(GatewayError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn memory_store_tracks_sequences_and_edits() {
        let store = MemoryMessageStore::new();
        let room = RoomId::Channel(7);
        let record = FanoutMessage {
            id: "m1".into(),
            room: room.clone(),
            sender_id: 1,
            op: MessageOp::Create,
            payload: "hello".into(),
            sequence: 1,
            idempotency_key: "k1".into(),
            created_at: chrono::Utc::now(),
        };
        store.append(&record).await.expect("append");
        assert_eq!(store.last_sequence(&room).await.expect("seq"), 1);

        let edit = FanoutMessage {
            op: MessageOp::Edit,
            payload: "edited".into(),
            sequence: 2,
            idempotency_key: "edit:m1".into(),
            ..record.clone()
        };
        store.append(&edit).await.expect("append edit");
        let fetched = store.fetch("m1").await.expect("fetch").expect("present");
        assert_eq!(fetched.payload, "edited");
        assert_eq!(store.last_sequence(&room).await.expect("seq"), 2);

        let delete = FanoutMessage {
            op: MessageOp::Delete,
            sequence: 3,
            idempotency_key: "delete:m1".into(),
            ..record
        };
        store.append(&delete).await.expect("append delete");
        assert!(store.fetch("m1").await.expect("fetch").is_none());
    }
}

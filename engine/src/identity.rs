//! Client-side identity.
//!
//! Record ids are random UUIDv4 strings minted on the device. No backend
//! round trip is involved, so creation works offline and a re-sent create is
//! an idempotent upsert of the same id.

use crate::RecordId;
use uuid::Uuid;

/// Mint a fresh record id.
pub fn new_record_id() -> RecordId {
    Uuid::new_v4().to_string()
}

/// Whether `id` parses as a UUID. Ids from other sources are accepted by the
/// store but are not produced by this module.
pub fn is_client_id(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

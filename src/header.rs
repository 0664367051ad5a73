//! The database header record.
//!
//! A header is the pointer-to-head of the whole database: it names the roots
//! of the three b-trees plus the counters that define the committed state.
//! It is rewritten (by append, never in place) on every commit; the freshest
//! valid header frame wins on open.
//!
//! ## Public invariants (must not change without a disk version bump)
//!
//! - **Payload**: `[disk_version:u32 LE]` followed by the postcard-encoded
//!   body for that version.
//! - Disk versions 1-3 are unreadable and fail the open.
//! - Version 4 predates the security blob; it is upgraded in-memory by
//!   defaulting the missing trailing field.
//! - Versions 5 through [`DISK_VERSION`](crate::formats::DISK_VERSION) share
//!   the current body layout.

use crate::btree::TreeState;
use crate::error::{DbError, DbResult};
use crate::formats::{DISK_VERSION, DISK_VERSION_MIN};
use serde::{Deserialize, Serialize};

/// Default maximum revision-tree depth retained after stemming.
pub const DEFAULT_REVS_LIMIT: u64 = 1000;

/// The committed-state record serialized into header frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbHeader {
    /// Largest update sequence covered by this header.
    pub update_seq: u64,
    /// Number of purge batches applied so far.
    pub purge_seq: u64,
    /// Pointer to the most recent purged `(id, revs)` list, if any.
    pub purged_docs: Option<u64>,
    /// Root state of the by-id tree.
    pub by_id_state: TreeState,
    /// Root state of the by-seq tree.
    pub by_seq_state: TreeState,
    /// Root state of the local-docs tree.
    pub local_state: TreeState,
    /// Pointer to the security policy blob, if one was ever written.
    pub security_ptr: Option<u64>,
    /// Maximum revision-tree depth retained after stemming.
    pub revs_limit: u64,
}

impl Default for DbHeader {
    fn default() -> Self {
        DbHeader {
            update_seq: 0,
            purge_seq: 0,
            purged_docs: None,
            by_id_state: TreeState::default(),
            by_seq_state: TreeState::default(),
            local_state: TreeState::default(),
            security_ptr: None,
            revs_limit: DEFAULT_REVS_LIMIT,
        }
    }
}

/// Version-4 body: everything up to (but not including) `security_ptr`.
#[derive(Debug, Deserialize)]
struct HeaderBodyV4 {
    update_seq: u64,
    purge_seq: u64,
    purged_docs: Option<u64>,
    by_id_state: TreeState,
    by_seq_state: TreeState,
    local_state: TreeState,
    revs_limit: u64,
}

impl HeaderBodyV4 {
    /// Pad the missing trailing fields with defaults.
    fn upgrade(self) -> DbHeader {
        DbHeader {
            update_seq: self.update_seq,
            purge_seq: self.purge_seq,
            purged_docs: self.purged_docs,
            by_id_state: self.by_id_state,
            by_seq_state: self.by_seq_state,
            local_state: self.local_state,
            security_ptr: None,
            revs_limit: self.revs_limit,
        }
    }
}

impl DbHeader {
    /// Encode the header as a frame payload, tagged with the current disk
    /// version.
    pub fn encode(&self) -> DbResult<Vec<u8>> {
        let body = postcard::to_allocvec(self).map_err(|e| DbError::Encode(e.to_string()))?;
        let mut payload = Vec::with_capacity(4 + body.len());
        payload.extend_from_slice(&DISK_VERSION.to_le_bytes());
        payload.extend_from_slice(&body);
        Ok(payload)
    }

    /// Decode a header frame payload, upgrading legacy widths in-memory.
    pub fn decode(payload: &[u8]) -> DbResult<DbHeader> {
        if payload.len() < 4 {
            return Err(DbError::Format("header payload too short".into()));
        }
        let version = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let body = &payload[4..];
        match version {
            4 => {
                let v4: HeaderBodyV4 =
                    postcard::from_bytes(body).map_err(|e| DbError::Decode(e.to_string()))?;
                Ok(v4.upgrade())
            }
            5..=DISK_VERSION => {
                postcard::from_bytes(body).map_err(|e| DbError::Decode(e.to_string()))
            }
            other => Err(DbError::DiskVersion {
                found: other,
                min: DISK_VERSION_MIN,
                max: DISK_VERSION,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_current_version() {
        let h = DbHeader {
            update_seq: 42,
            purge_seq: 2,
            purged_docs: Some(99),
            security_ptr: Some(1234),
            revs_limit: 50,
            ..DbHeader::default()
        };
        let payload = h.encode().unwrap();
        assert_eq!(DbHeader::decode(&payload).unwrap(), h);
    }

    #[test]
    fn header_v4_upgrades_with_defaulted_security() {
        // Hand-build a v4 payload: version tag + v4-width postcard body.
        #[derive(serde::Serialize)]
        struct V4Out {
            update_seq: u64,
            purge_seq: u64,
            purged_docs: Option<u64>,
            by_id_state: TreeState,
            by_seq_state: TreeState,
            local_state: TreeState,
            revs_limit: u64,
        }
        let body = postcard::to_allocvec(&V4Out {
            update_seq: 7,
            purge_seq: 1,
            purged_docs: None,
            by_id_state: TreeState::default(),
            by_seq_state: TreeState::default(),
            local_state: TreeState::default(),
            revs_limit: 500,
        })
        .unwrap();
        let mut payload = 4u32.to_le_bytes().to_vec();
        payload.extend_from_slice(&body);

        let h = DbHeader::decode(&payload).unwrap();
        assert_eq!(h.update_seq, 7);
        assert_eq!(h.revs_limit, 500);
        assert_eq!(h.security_ptr, None);
    }

    #[test]
    fn header_rejects_ancient_and_future_versions() {
        for version in [1u32, 2, 3, DISK_VERSION + 1] {
            let mut payload = version.to_le_bytes().to_vec();
            payload.extend_from_slice(&postcard::to_allocvec(&DbHeader::default()).unwrap());
            let err = DbHeader::decode(&payload).unwrap_err();
            assert!(
                matches!(err, DbError::DiskVersion { found, .. } if found == version),
                "version {version} must be rejected"
            );
        }
    }
}

//! Rich-text document CRDT helpers over Yrs (YATA).
//!
//! A document's content lives in the root text type `content`. Snapshots
//! and deltas are Yrs v1 updates; merging is commutative, associative and
//! idempotent, so replicas converge regardless of delivery order.
//!
//! ```text
//! snapshot ──┐
//! delta 1 ───┼──► Doc::apply_update ──► encode_state_as_update_v1 ──► snapshot'
//! delta n ───┘                      └─► get_text("content") ──────► materialized String
//! ```
//!
//! Reference: Nicolaescu et al. — "Near Real-Time Peer-to-Peer Shared Editing
//! on Extensible Data Types" (YATA)

use tessera_core::{SyncError, SyncResult};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Root text type holding document content.
pub const CONTENT: &str = "content";

/// Reject bytes that are not a Yrs v1 update.
pub fn validate_update(data: &[u8]) -> SyncResult<()> {
    Update::decode_v1(data)
        .map(|_| ())
        .map_err(|e| SyncError::Validation(format!("invalid document update: {e}")))
}

fn load(state: &[u8]) -> SyncResult<Doc> {
    let doc = Doc::new();
    if !state.is_empty() {
        let update = Update::decode_v1(state)
            .map_err(|e| SyncError::Fatal(format!("corrupt document state: {e}")))?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| SyncError::Fatal(format!("corrupt document state: {e}")))?;
    }
    Ok(doc)
}

fn encode_full(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Fold `updates` into `state` and return the new snapshot.
pub fn merge<'a>(state: &[u8], updates: impl IntoIterator<Item = &'a [u8]>) -> SyncResult<Vec<u8>> {
    let doc = load(state)?;
    {
        let mut txn = doc.transact_mut();
        for data in updates {
            let update = Update::decode_v1(data)
                .map_err(|e| SyncError::Validation(format!("invalid document update: {e}")))?;
            txn.apply_update(update)
                .map_err(|e| SyncError::Validation(format!("document update rejected: {e}")))?;
        }
    }
    Ok(encode_full(&doc))
}

/// Plain-text view of a snapshot.
pub fn materialize(state: &[u8]) -> SyncResult<String> {
    let doc = load(state)?;
    let txn = doc.transact();
    Ok(txn
        .get_text(CONTENT)
        .map(|text| text.get_string(&txn))
        .unwrap_or_default())
}

/// Encoded state vector of a snapshot.
pub fn state_vector(state: &[u8]) -> SyncResult<Vec<u8>> {
    let doc = load(state)?;
    let txn = doc.transact();
    Ok(txn.state_vector().encode_v1())
}

/// Delta a peer holding `remote_sv` is missing.
pub fn diff(state: &[u8], remote_sv: &[u8]) -> SyncResult<Vec<u8>> {
    let doc = load(state)?;
    let sv = StateVector::decode_v1(remote_sv)
        .map_err(|e| SyncError::Validation(format!("invalid state vector: {e}")))?;
    let txn = doc.transact();
    Ok(txn.encode_diff_v1(&sv))
}

/// Delta inserting `text` at character `index` of the content.
pub fn insert_text(state: &[u8], index: u32, text: &str) -> SyncResult<Vec<u8>> {
    let doc = load(state)?;
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let content = txn.get_or_insert_text(CONTENT);
        let len = content.len(&txn);
        content.insert(&mut txn, index.min(len), text);
    }
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&before))
}

/// Delta appending `text` to the content.
pub fn append_text(state: &[u8], text: &str) -> SyncResult<Vec<u8>> {
    insert_text(state, u32::MAX, text)
}

//! Set reconciliation over BARs.
//!
//! The initiator posts a pickled cursor range plus the BARs it holds in that
//! range ("IHAVEs"). The responder compares them against its own store and
//! answers with a pickled covered range followed by action records: `push`
//! (send me that bundle) or `pull` (fetch this bundle from me), each naming
//! a bundle by its 15-byte id prefix. The initiator repeats enquiries until
//! a round produces no actions; every action strictly shrinks the symmetric
//! difference of the two stores, so the loop terminates.

use std::collections::HashMap;

use crate::bar::{Bar, BAR_BYTES, BAR_PREFIX_BYTES};
use crate::cursor::{SyncCursor, CURSOR_PICKLE_BYTES};
use crate::error::RhizomeError;
use crate::store::RhizomeStore;

pub const OP_PUSH: u8 = 1;
pub const OP_PULL: u8 = 2;
pub const RECORD_BYTES: usize = 1 + BAR_PREFIX_BYTES;
/// Responses never exceed this, regardless of how many BARs arrived.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024;
/// BARs per enquiry round.
pub const ENQUIRY_BATCH: usize = 1_000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SyncAction {
    pub op: u8,
    pub bid_prefix: [u8; BAR_PREFIX_BYTES],
}

/// Build one enquiry body: pickled range + our BARs in it.
pub fn build_enquiry(
    store: &RhizomeStore,
    cursor: &mut SyncCursor,
) -> Result<Vec<u8>, RhizomeError> {
    let bars = store.bars_in_range(cursor, ENQUIRY_BATCH)?;
    let mut body = cursor.pickle().to_vec();
    for bar in bars {
        body.extend_from_slice(&bar.encode());
    }
    Ok(body)
}

/// Answer an enquiry against the local store.
pub fn fill_response(store: &RhizomeStore, request: &[u8]) -> Result<Vec<u8>, RhizomeError> {
    if request.len() < CURSOR_PICKLE_BYTES {
        return Err(RhizomeError::Protocol("enquiry shorter than a cursor".into()));
    }
    let bar_bytes = &request[CURSOR_PICKLE_BYTES..];
    if bar_bytes.len() % BAR_BYTES != 0 {
        return Err(RhizomeError::Protocol(format!(
            "enquiry BAR list of {} bytes is not a multiple of {BAR_BYTES}",
            bar_bytes.len()
        )));
    }
    let mut theirs = Vec::with_capacity(bar_bytes.len() / BAR_BYTES);
    for chunk in bar_bytes.chunks_exact(BAR_BYTES) {
        theirs.push(Bar::decode(chunk)?);
    }

    let mut cursor = SyncCursor::full_range();
    let ours = store.bars_in_range(&mut cursor, usize::MAX)?;
    let ours_by_prefix: HashMap<[u8; BAR_PREFIX_BYTES], u64> =
        ours.iter().map(|bar| (bar.bid_prefix, bar.version)).collect();
    let theirs_by_prefix: HashMap<[u8; BAR_PREFIX_BYTES], u64> =
        theirs.iter().map(|bar| (bar.bid_prefix, bar.version)).collect();

    let mut body = cursor.pickle().to_vec();
    let mut push_record = |body: &mut Vec<u8>, op: u8, prefix: &[u8; BAR_PREFIX_BYTES]| {
        if body.len() + RECORD_BYTES > MAX_RESPONSE_BYTES {
            return false;
        }
        body.push(op);
        body.extend_from_slice(prefix);
        true
    };

    for bar in &theirs {
        let wanted = match ours_by_prefix.get(&bar.bid_prefix) {
            None => true,
            Some(&our_version) => bar.version > our_version,
        };
        if wanted && !push_record(&mut body, OP_PUSH, &bar.bid_prefix) {
            break;
        }
    }
    for bar in &ours {
        let offer = match theirs_by_prefix.get(&bar.bid_prefix) {
            None => true,
            Some(&their_version) => bar.version > their_version,
        };
        if offer && !push_record(&mut body, OP_PULL, &bar.bid_prefix) {
            break;
        }
    }
    Ok(body)
}

/// Split a response body into its covered-range pickle and action records.
pub fn parse_response(body: &[u8]) -> Result<(&[u8], Vec<SyncAction>), RhizomeError> {
    if body.len() < CURSOR_PICKLE_BYTES {
        return Err(RhizomeError::Protocol("response shorter than a cursor".into()));
    }
    let (pickle, records) = body.split_at(CURSOR_PICKLE_BYTES);
    if records.len() % RECORD_BYTES != 0 {
        return Err(RhizomeError::Protocol(format!(
            "response records of {} bytes are not a multiple of {RECORD_BYTES}",
            records.len()
        )));
    }
    let mut actions = Vec::with_capacity(records.len() / RECORD_BYTES);
    for chunk in records.chunks_exact(RECORD_BYTES) {
        let op = chunk[0];
        if op != OP_PUSH && op != OP_PULL {
            return Err(RhizomeError::Protocol(format!("unknown sync op {op}")));
        }
        let mut bid_prefix = [0u8; BAR_PREFIX_BYTES];
        bid_prefix.copy_from_slice(&chunk[1..]);
        actions.push(SyncAction { op, bid_prefix });
    }
    Ok((pickle, actions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Manifest, SERVICE_FILE};
    use crate::store::PRIORITY_DEFAULT;
    use mycel_identity as identity;
    use rand_core::OsRng;

    fn add_bundle(store: &mut RhizomeStore, payload: &[u8], version: u64) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.set("service", SERVICE_FILE);
        manifest.set("name", "f");
        manifest.set_u64("date", 1);
        manifest.set_u64("version", version);
        manifest.set_u64("filesize", payload.len() as u64);
        if !payload.is_empty() {
            manifest.set("filehash", identity::sha512_hex(payload));
        }
        manifest.create_id(OsRng, None);
        manifest.sign().expect("sign");
        store.add_bundle(&manifest, Some(payload), PRIORITY_DEFAULT).expect("add");
        manifest
    }

    #[test]
    fn disjoint_stores_produce_push_and_pull_actions() {
        let mut client = RhizomeStore::in_memory(10 << 20).expect("store");
        let mut server = RhizomeStore::in_memory(10 << 20).expect("store");
        let client_only = add_bundle(&mut client, b"client bundle", 1);
        let server_only = add_bundle(&mut server, b"server bundle", 1);

        let mut cursor = SyncCursor::full_range();
        let enquiry = build_enquiry(&client, &mut cursor).expect("enquiry");
        let response = fill_response(&server, &enquiry).expect("response");
        let (_, actions) = parse_response(&response).expect("parse");

        assert_eq!(actions.len(), 2);
        let push = actions.iter().find(|action| action.op == OP_PUSH).expect("push");
        let pull = actions.iter().find(|action| action.op == OP_PULL).expect("pull");
        assert_eq!(
            &push.bid_prefix[..],
            client_only.id().expect("id").prefix(BAR_PREFIX_BYTES)
        );
        assert_eq!(
            &pull.bid_prefix[..],
            server_only.id().expect("id").prefix(BAR_PREFIX_BYTES)
        );
    }

    #[test]
    fn equal_stores_produce_no_actions() {
        let mut a = RhizomeStore::in_memory(10 << 20).expect("store");
        let manifest = add_bundle(&mut a, b"shared", 1);
        let mut b = RhizomeStore::in_memory(10 << 20).expect("store");
        b.add_bundle(&manifest, Some(b"shared"), PRIORITY_DEFAULT).expect("add");

        let mut cursor = SyncCursor::full_range();
        let enquiry = build_enquiry(&a, &mut cursor).expect("enquiry");
        let (_, actions) =
            parse_response(&fill_response(&b, &enquiry).expect("response")).expect("parse");
        assert!(actions.is_empty());
    }

    #[test]
    fn newer_version_wins_in_both_directions() {
        let mut old_side = RhizomeStore::in_memory(10 << 20).expect("store");
        let v1 = add_bundle(&mut old_side, b"v1", 1);

        let mut new_side = RhizomeStore::in_memory(10 << 20).expect("store");
        let mut v2 = Manifest::new();
        for key in ["service", "name", "date", "id"] {
            if let Some(value) = v1.get(key) {
                v2.set(key, value);
            }
        }
        v2.set_u64("version", 2);
        v2.set_u64("filesize", 2);
        v2.set("filehash", identity::sha512_hex(b"v2"));
        v2.set_secret(*v1.secret().expect("secret")).expect("id match");
        v2.sign().expect("sign");
        new_side.add_bundle(&v2, Some(b"v2"), PRIORITY_DEFAULT).expect("add");

        // old side asks new side: answer must be a pull of the newer version
        let mut cursor = SyncCursor::full_range();
        let enquiry = build_enquiry(&old_side, &mut cursor).expect("enquiry");
        let (_, actions) =
            parse_response(&fill_response(&new_side, &enquiry).expect("response"))
                .expect("parse");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].op, OP_PULL);

        // and the reverse direction asks for a push of it
        let mut cursor = SyncCursor::full_range();
        let enquiry = build_enquiry(&new_side, &mut cursor).expect("enquiry");
        let (_, actions) =
            parse_response(&fill_response(&old_side, &enquiry).expect("response"))
                .expect("parse");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].op, OP_PUSH);
    }

    #[test]
    fn malformed_enquiries_are_protocol_errors() {
        let store = RhizomeStore::in_memory(10 << 20).expect("store");
        assert!(matches!(
            fill_response(&store, &[0u8; 4]),
            Err(RhizomeError::Protocol(_))
        ));
        assert!(matches!(
            fill_response(&store, &[0u8; CURSOR_PICKLE_BYTES + 7]),
            Err(RhizomeError::Protocol(_))
        ));
    }

    #[test]
    fn response_is_capped_at_64k() {
        let empty = RhizomeStore::in_memory(10 << 20).expect("store");
        // an enquiry advertising ~5000 unknown BARs would need 80000 bytes
        let mut request = SyncCursor::full_range().pickle().to_vec();
        for i in 0..5_000u32 {
            let mut bar = [0u8; BAR_BYTES];
            bar[..4].copy_from_slice(&i.to_be_bytes());
            bar[20] = 1; // version, so the record parses
            request.extend_from_slice(&bar);
        }
        let response = fill_response(&empty, &request).expect("response");
        assert!(response.len() <= MAX_RESPONSE_BYTES);
    }
}

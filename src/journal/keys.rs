//! Key-space layout for the journal's backing ordered key-value store.
//!
//! Reserved metadata keys live under the `0x00` domain byte so that they
//! always sort before entry keys (domain `0x01` followed by a big-endian
//! index), matching the "Persisted state layout" reserved-key scheme.

use byteorder::{BigEndian, ByteOrder};

const DOMAIN_META: u8 = 0x00;
const DOMAIN_ENTRY: u8 = 0x01;

pub const CURRENT_TERM: &[u8] = &[DOMAIN_META, 0];
pub const VOTED_FOR: &[u8] = &[DOMAIN_META, 1];
pub const LOG_SIZE: &[u8] = &[DOMAIN_META, 2];
pub const LOG_START: &[u8] = &[DOMAIN_META, 3];
pub const COMMIT_INDEX: &[u8] = &[DOMAIN_META, 4];
pub const CLUSTER_ID: &[u8] = &[DOMAIN_META, 5];
pub const MEMBERS: &[u8] = &[DOMAIN_META, 6];
pub const MEMBERSHIP_EPOCH: &[u8] = &[DOMAIN_META, 7];
pub const PREVIOUS_MEMBERS: &[u8] = &[DOMAIN_META, 8];
pub const PREVIOUS_MEMBERSHIP_EPOCH: &[u8] = &[DOMAIN_META, 9];
pub const TRIM_GUARD_TERM: &[u8] = &[DOMAIN_META, 10];

/// Encodes an entry key: domain byte followed by the big-endian index, so
/// that iteration over the entry keyspace visits entries in log order.
pub fn entry_key(index: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = DOMAIN_ENTRY;
    BigEndian::write_u64(&mut key[1..], index);
    key
}

pub fn entry_index(key: &[u8]) -> Option<u64> {
    if key.len() == 9 && key[0] == DOMAIN_ENTRY {
        Some(BigEndian::read_u64(&key[1..]))
    } else {
        None
    }
}

pub fn entry_prefix() -> [u8; 1] {
    [DOMAIN_ENTRY]
}

//! Internal key packing and the layered comparator.
//!
//! Every entry the engine orders carries an internal key: the user key
//! followed by a little-endian fixed64 tag packing a 56-bit sequence number
//! with an 8-bit value type.
//!
//! ```text
//! +----------------+-------------------------------+
//! | user key bytes | (sequence << 8) | type  (u64) |
//! +----------------+-------------------------------+
//! ```
//!
//! Internal keys order by ascending user key, then *descending* sequence,
//! then descending type, so a seek positioned at `(key, seq)` lands on the
//! newest entry for `key` visible at `seq`.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::{decode_fixed64, get_length_prefixed_slice, put_fixed64, put_varint32};
use crate::comparator::Comparator;

pub type SequenceNumber = u64;

/// Sequence numbers occupy 56 bits, leaving the low byte of the tag for the
/// value type.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// The 8-byte tag appended to every user key.
pub const TAG_LEN: usize = 8;

/// Discriminates live values from deletion tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

/// The type used when constructing probe keys. It must be the numerically
/// largest `ValueType` so that a probe for `(key, seq)` sorts before every
/// entry with the same key and sequence, landing at-or-before the target.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    pub fn from_u8(byte: u8) -> Option<ValueType> {
        match byte {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

pub fn pack_sequence_and_type(seq: SequenceNumber, ty: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | ty as u64
}

/// Appends `user_key` with its tag to `dst`.
pub fn append_internal_key(
    dst: &mut Vec<u8>,
    user_key: &[u8],
    seq: SequenceNumber,
    ty: ValueType,
) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_sequence_and_type(seq, ty));
}

/// Strips the tag. Requires `internal_key.len() >= TAG_LEN`.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= TAG_LEN);
    &internal_key[..internal_key.len() - TAG_LEN]
}

/// An internal key split into its parts, borrowing the user key.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

/// Splits an internal key, rejecting short keys and unknown type bytes.
pub fn parse_internal_key(internal_key: &[u8]) -> Option<ParsedInternalKey<'_>> {
    if internal_key.len() < TAG_LEN {
        return None;
    }
    let tag = decode_fixed64(&internal_key[internal_key.len() - TAG_LEN..]);
    let value_type = ValueType::from_u8((tag & 0xff) as u8)?;
    Some(ParsedInternalKey {
        user_key: extract_user_key(internal_key),
        sequence: tag >> 8,
        value_type,
    })
}

/// A probe key for memtable lookups.
///
/// Layout: varint32 of the internal key length, then the internal key. The
/// prefixed form is what the memtable's skiplist stores, so probes can be
/// compared against entries directly; the unprefixed suffix serves table
/// lookups.
pub struct LookupKey {
    data: Vec<u8>,
    kstart: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> LookupKey {
        let mut data = Vec::with_capacity(user_key.len() + 13);
        put_varint32(&mut data, (user_key.len() + TAG_LEN) as u32);
        let kstart = data.len();
        append_internal_key(&mut data, user_key, seq, VALUE_TYPE_FOR_SEEK);
        LookupKey { data, kstart }
    }

    /// The length-prefixed form used to probe the memtable.
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The bare internal key used to probe tables.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.kstart..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.data[self.kstart..self.data.len() - TAG_LEN]
    }
}

/// Orders internal keys by wrapping a user comparator.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> InternalKeyComparator {
        InternalKeyComparator { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "cinderdb.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                let atag = decode_fixed64(&a[a.len() - TAG_LEN..]);
                let btag = decode_fixed64(&b[b.len() - TAG_LEN..]);
                // Descending tag: the larger (newer) sequence sorts first.
                btag.cmp(&atag)
            }
            ord => ord,
        }
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user.find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len()
            && self.user.compare(user_start, &tmp) == Ordering::Less
        {
            // Shorter physically but larger logically; re-tag with the
            // earliest possible tag so it still precedes real entries.
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            *key = tmp;
        }
    }
}

/// Compares the length-prefixed internal keys the memtable's skiplist
/// stores. Entries start with a varint32 key length, so two entries are
/// ordered by decoding both prefixes and delegating to the internal-key
/// comparator.
#[derive(Clone)]
pub struct MemtableKeyComparator {
    pub internal: InternalKeyComparator,
}

impl MemtableKeyComparator {
    pub fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (akey, _) = get_length_prefixed_slice(a).expect("corrupt memtable entry");
        let (bkey, _) = get_length_prefixed_slice(b).expect("corrupt memtable entry");
        self.internal.compare(akey, bkey)
    }
}

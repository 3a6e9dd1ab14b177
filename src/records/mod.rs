//! # Record Codec
//!
//! Logical tuples, index schemas, and the on-page record payload format.
//!
//! ## Record Payload Layout
//!
//! A record payload is a sequence of length-prefixed fields:
//!
//! ```text
//! +----------+-----------+----------+-----------+-----
//! | len0 (2B)| field0    | len1 (2B)| field1    | ...
//! +----------+-----------+----------+-----------+-----
//! ```
//!
//! - **len** is little-endian; the value `0xFFFF` marks a NULL field and is
//!   followed by no data bytes.
//! - The field count is not stored; it is implied by the record status
//!   (node pointers carry `n_uniq + 1` fields, leaf records carry the full
//!   schema column count).
//!
//! ## Node Pointers
//!
//! A node pointer stores the first `n_uniq` fields of a user record followed
//! by a fixed 4-byte big-endian child page number as the last field. The
//! child field never participates in comparisons; `DataTuple::n_cmp` bounds
//! how many leading fields a comparison examines.
//!
//! ## Comparison Semantics
//!
//! Fields compare bytewise (keys are stored in memcmp order, e.g. big-endian
//! integers). NULL sorts below any data. A record carrying the minimum-record
//! flag compares below everything; it stands in for negative infinity on the
//! leftmost node pointer of each non-leaf level.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use smallvec::SmallVec;

/// Field length value marking NULL.
pub const FIELD_NULL: u16 = 0xFFFF;

/// Size of the length prefix preceding each stored field.
pub const FIELD_LEN_SIZE: usize = 2;

/// Fixed size of the child page number field in a node pointer.
pub const NODE_PTR_FIELD_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Exact stored length for fixed-size columns.
    pub fixed_len: Option<u16>,
    /// Maximum stored length for prefix-indexed columns.
    pub prefix_len: Option<u16>,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn fixed(len: u16) -> Self {
        Self {
            fixed_len: Some(len),
            prefix_len: None,
            nullable: false,
        }
    }

    pub fn variable() -> Self {
        Self {
            fixed_len: None,
            prefix_len: None,
            nullable: false,
        }
    }

    pub fn prefix(len: u16) -> Self {
        Self {
            fixed_len: None,
            prefix_len: Some(len),
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Column layout of one index tree.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub cols: Vec<ColumnDef>,
    /// Number of leading fields that uniquely identify a record; node
    /// pointers carry exactly this prefix.
    pub n_uniq: usize,
    /// Compact row format flag; selects the redo opcode variant.
    pub comp: bool,
}

impl IndexSchema {
    pub fn new(cols: Vec<ColumnDef>, n_uniq: usize, comp: bool) -> Self {
        debug_assert!(n_uniq >= 1 && n_uniq <= cols.len());
        Self { cols, n_uniq, comp }
    }

    /// Single fixed-width key column, the common test shape.
    pub fn single_fixed_key(len: u16, comp: bool) -> Self {
        Self::new(vec![ColumnDef::fixed(len)], 1, comp)
    }

    pub fn n_fields(&self) -> usize {
        self.cols.len()
    }

    /// Field count of a node pointer record: key prefix plus child page.
    pub fn node_ptr_fields(&self) -> usize {
        self.n_uniq + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Null,
    Data(Vec<u8>),
}

impl Field {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Field::Null => None,
            Field::Data(b) => Some(b),
        }
    }

    fn stored_size(&self) -> usize {
        match self {
            Field::Null => FIELD_LEN_SIZE,
            Field::Data(b) => FIELD_LEN_SIZE + b.len(),
        }
    }
}

/// A logical tuple: the in-memory form of a record before conversion to
/// page bytes, and the search key form handed to cursors.
#[derive(Debug, Clone)]
pub struct DataTuple {
    pub fields: Vec<Field>,
    /// Number of leading fields that participate in comparisons. Node
    /// pointer tuples set this to `n_uniq` so the child field is skipped.
    pub n_cmp: usize,
    /// Minimum-record flag carried into the record header on insert.
    pub min_rec: bool,
}

impl DataTuple {
    pub fn new(fields: Vec<Field>) -> Self {
        let n_cmp = fields.len();
        Self {
            fields,
            n_cmp,
            min_rec: false,
        }
    }

    pub fn from_key(key: &[u8]) -> Self {
        Self::new(vec![Field::Data(key.to_vec())])
    }

    pub fn with_n_cmp(mut self, n_cmp: usize) -> Self {
        debug_assert!(n_cmp <= self.fields.len());
        self.n_cmp = n_cmp;
        self
    }

    /// Payload size of the converted record, excluding the record header.
    pub fn converted_size(&self) -> usize {
        self.fields.iter().map(Field::stored_size).sum()
    }

    /// Serializes the tuple into a record payload.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.converted_size());
        for f in &self.fields {
            match f {
                Field::Null => out.extend_from_slice(&FIELD_NULL.to_le_bytes()),
                Field::Data(b) => {
                    debug_assert!(b.len() < FIELD_NULL as usize);
                    out.extend_from_slice(&(b.len() as u16).to_le_bytes());
                    out.extend_from_slice(b);
                }
            }
        }
        out
    }
}

/// One decoded field boundary: offset into the payload and length, or NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub offset: u16,
    pub len: Option<u16>,
}

/// Decoded field boundaries of one record payload, the moral equivalent of
/// an offsets array.
#[derive(Debug, Clone)]
pub struct RecOffsets {
    pub fields: SmallVec<[FieldRef; 8]>,
    /// Total payload length in bytes.
    pub size: u16,
}

impl RecOffsets {
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field<'a>(&self, payload: &'a [u8], i: usize) -> Option<&'a [u8]> {
        let f = self.fields[i];
        let len = f.len?;
        Some(&payload[f.offset as usize..f.offset as usize + len as usize])
    }
}

/// Parses the field boundaries of a record payload holding `n_fields`
/// length-prefixed fields.
pub fn rec_get_offsets(payload: &[u8], n_fields: usize) -> Result<RecOffsets> {
    let mut fields = SmallVec::new();
    let mut pos = 0usize;
    for i in 0..n_fields {
        ensure!(
            pos + FIELD_LEN_SIZE <= payload.len(),
            "field {} length prefix extends past record payload ({} > {})",
            i,
            pos + FIELD_LEN_SIZE,
            payload.len()
        );
        let len = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
        pos += FIELD_LEN_SIZE;
        if len == FIELD_NULL {
            fields.push(FieldRef {
                offset: pos as u16,
                len: None,
            });
        } else {
            ensure!(
                pos + len as usize <= payload.len(),
                "field {} data extends past record payload",
                i
            );
            fields.push(FieldRef {
                offset: pos as u16,
                len: Some(len),
            });
            pos += len as usize;
        }
    }
    Ok(RecOffsets {
        fields,
        size: pos as u16,
    })
}

fn cmp_field(a: Option<&[u8]>, b: Option<&[u8]>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

/// Compares a search tuple against a record payload. Only the first
/// `tuple.n_cmp` fields are examined; if they all compare equal the result
/// is `Equal` (prefix semantics, as node-pointer routing requires).
///
/// `rec_min_rec` is the record's minimum-record flag; such a record is below
/// every tuple.
pub fn cmp_tuple_rec(
    tuple: &DataTuple,
    payload: &[u8],
    offsets: &RecOffsets,
    rec_min_rec: bool,
) -> Ordering {
    match (tuple.min_rec, rec_min_rec) {
        (true, true) => return Ordering::Equal,
        (false, true) => return Ordering::Greater,
        (true, false) => return Ordering::Less,
        (false, false) => {}
    }
    let n = tuple.n_cmp.min(offsets.n_fields());
    for i in 0..n {
        let a = tuple.fields[i].as_bytes();
        let b = offsets.field(payload, i);
        let ord = cmp_field(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Compares two record payloads field by field over the first `n_cmp`
/// fields, honoring the minimum-record flags.
#[allow(clippy::too_many_arguments)]
pub fn cmp_rec_rec(
    payload_a: &[u8],
    offsets_a: &RecOffsets,
    a_min_rec: bool,
    payload_b: &[u8],
    offsets_b: &RecOffsets,
    b_min_rec: bool,
    n_cmp: usize,
) -> Ordering {
    match (a_min_rec, b_min_rec) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }
    let n = n_cmp.min(offsets_a.n_fields()).min(offsets_b.n_fields());
    for i in 0..n {
        let ord = cmp_field(offsets_a.field(payload_a, i), offsets_b.field(payload_b, i));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(keys: &[&[u8]]) -> DataTuple {
        DataTuple::new(keys.iter().map(|k| Field::Data(k.to_vec())).collect())
    }

    #[test]
    fn payload_round_trip() {
        let t = tuple(&[b"alpha", b"b"]);
        let payload = t.to_payload();
        assert_eq!(payload.len(), t.converted_size());

        let offs = rec_get_offsets(&payload, 2).unwrap();
        assert_eq!(offs.field(&payload, 0), Some(&b"alpha"[..]));
        assert_eq!(offs.field(&payload, 1), Some(&b"b"[..]));
        assert_eq!(offs.size as usize, payload.len());
    }

    #[test]
    fn null_field_encoding() {
        let t = DataTuple::new(vec![Field::Data(b"k".to_vec()), Field::Null]);
        let payload = t.to_payload();
        let offs = rec_get_offsets(&payload, 2).unwrap();
        assert_eq!(offs.field(&payload, 1), None);
        assert_eq!(offs.fields[1].len, None);
    }

    #[test]
    fn truncated_payload_rejected() {
        let t = tuple(&[b"abcdef"]);
        let payload = t.to_payload();
        assert!(rec_get_offsets(&payload[..3], 1).is_err());
        assert!(rec_get_offsets(&payload, 2).is_err());
    }

    #[test]
    fn tuple_rec_ordering() {
        let rec = tuple(&[b"mango"]);
        let payload = rec.to_payload();
        let offs = rec_get_offsets(&payload, 1).unwrap();

        let lo = tuple(&[b"apple"]);
        let eq = tuple(&[b"mango"]);
        let hi = tuple(&[b"zebra"]);

        assert_eq!(cmp_tuple_rec(&lo, &payload, &offs, false), Ordering::Less);
        assert_eq!(cmp_tuple_rec(&eq, &payload, &offs, false), Ordering::Equal);
        assert_eq!(cmp_tuple_rec(&hi, &payload, &offs, false), Ordering::Greater);
    }

    #[test]
    fn min_rec_compares_below_everything() {
        let rec = tuple(&[b"aaa"]);
        let payload = rec.to_payload();
        let offs = rec_get_offsets(&payload, 1).unwrap();

        let probe = tuple(&[b""]);
        assert_eq!(cmp_tuple_rec(&probe, &payload, &offs, true), Ordering::Greater);
    }

    #[test]
    fn n_cmp_limits_comparison_to_key_prefix() {
        // A node-pointer tuple carries the child page as a trailing field
        // that must not influence ordering.
        let mut np = DataTuple::new(vec![
            Field::Data(b"key".to_vec()),
            Field::Data(1234u32.to_be_bytes().to_vec()),
        ]);
        np = np.with_n_cmp(1);

        let rec = tuple(&[b"key", &9999u32.to_be_bytes()]);
        let payload = rec.to_payload();
        let offs = rec_get_offsets(&payload, 2).unwrap();

        assert_eq!(cmp_tuple_rec(&np, &payload, &offs, false), Ordering::Equal);
    }

    #[test]
    fn null_sorts_first() {
        let rec = DataTuple::new(vec![Field::Null]);
        let payload = rec.to_payload();
        let offs = rec_get_offsets(&payload, 1).unwrap();

        let data = tuple(&[b"\x00"]);
        assert_eq!(cmp_tuple_rec(&data, &payload, &offs, false), Ordering::Greater);
    }

    #[test]
    fn rec_rec_comparison() {
        let a = tuple(&[b"aa", b"x"]).to_payload();
        let b = tuple(&[b"ab", b"a"]).to_payload();
        let oa = rec_get_offsets(&a, 2).unwrap();
        let ob = rec_get_offsets(&b, 2).unwrap();

        assert_eq!(cmp_rec_rec(&a, &oa, false, &b, &ob, false, 2), Ordering::Less);
        assert_eq!(cmp_rec_rec(&b, &ob, false, &a, &oa, false, 1), Ordering::Greater);
        assert_eq!(cmp_rec_rec(&a, &oa, true, &b, &ob, false, 2), Ordering::Less);
    }
}

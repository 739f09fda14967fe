//! Shard key bounds and metadata document helpers.

use std::cmp::Ordering;

use bson::{Bson, Document, RawDocumentBuf};

use crate::operations::types::{MigrationError, MigrationResult};

/// Whether the bound is open-ended, i.e. any of its fields is `MaxKey`.
///
/// Such a bound can not be used as a split point.
pub fn is_max_key_bound(bound: &Document) -> bool {
    bound.values().any(|value| matches!(value, Bson::MaxKey))
}

/// Order two bounds of the same shard key, field by field.
pub fn compare_bounds(a: &Document, b: &Document) -> Ordering {
    let mut a_values = a.values();
    let mut b_values = b.values();
    loop {
        match (a_values.next(), b_values.next()) {
            (Some(a), Some(b)) => match compare_values(a, b) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

/// Canonical cross-type order used by the server when comparing key values.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_) | Bson::DbPointer(_) => 12,
        Bson::MaxKey => 13,
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_), _) => {
            match (as_f64(a), as_f64(b)) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => Ordering::Equal,
            }
        }
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::Symbol(a), Bson::Symbol(b)) => a.cmp(b),
        (Bson::Document(a), Bson::Document(b)) => compare_bounds(a, b),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => a.cmp(b),
        (Bson::Timestamp(a), Bson::Timestamp(b)) => {
            (a.time, a.increment).cmp(&(b.time, b.increment))
        }
        (Bson::Binary(a), Bson::Binary(b)) => a.bytes.cmp(&b.bytes),
        (Bson::Array(a), Bson::Array(b)) => {
            for (a, b) in a.iter().zip(b) {
                match compare_values(a, b) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            a.len().cmp(&b.len())
        }
        _ => Ordering::Equal,
    }
}

/// Whether any field name, at any depth, contains a dot.
///
/// Compound shard keys on embedded fields (`{"_id.x": 1}`) produce such names.
pub fn has_dotted_field_names(doc: &Document) -> bool {
    doc.iter().any(|(key, value)| {
        key.contains('.')
            || match value {
                Bson::Document(inner) => has_dotted_field_names(inner),
                _ => false,
            }
    })
}

/// Check field names the way a structured document write does.
pub fn validate_field_names(doc: &Document) -> MigrationResult<()> {
    if has_dotted_field_names(doc) {
        return Err(MigrationError::bad_input(format!(
            "Invalid field name in document {doc}: field names must not contain '.'"
        )));
    }
    Ok(())
}

/// Serialize a metadata document to raw bytes, without any field name validation.
///
/// Chunk and collection records of compound shard keys carry dotted field names, which a
/// structured write would reject.
pub fn to_raw_document(doc: &Document) -> MigrationResult<RawDocumentBuf> {
    Ok(RawDocumentBuf::from_document(doc)?)
}

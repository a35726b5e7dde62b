//! `encode`/`decode` over the value universe, with record references
//! substituted through a manager-supplied persistence callback
//! (spec.md §4.1).

use crate::{
    record::{Record, RecordType},
    value::{Value, ValueSet},
    wire::{Wire, WireReference},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("record belongs to a different manager")]
    CrossManager,
    #[error("messagepack encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("messagepack decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Supplied by the manager during `encode`. Resolves a record to a
/// reference token, enqueueing it for recursive persistence if it's
/// not yet bound to this manager.
pub trait EncodeContext {
    fn resolve(&mut self, record: &Record) -> Result<(), CodecError>;
}

/// Supplied by the manager during `decode`. Rehydrates a reference
/// token into a live record through the identity cache.
pub trait DecodeContext {
    fn rehydrate(&self, gid: crate::id::Gid, kind: RecordType) -> Record;
}

pub fn encode(value: &Value, ctx: &mut dyn EncodeContext) -> Result<Vec<u8>, CodecError> {
    let wire = to_wire(value, ctx)?;
    Ok(rmp_serde::to_vec(&wire)?)
}

pub fn decode(bytes: &[u8], ctx: &dyn DecodeContext) -> Result<Value, CodecError> {
    let wire: Wire = rmp_serde::from_slice(bytes)?;
    Ok(from_wire(wire, ctx))
}

fn to_wire(value: &Value, ctx: &mut dyn EncodeContext) -> Result<Wire, CodecError> {
    Ok(match value {
        Value::Null => Wire::Null,
        Value::Bool(b) => Wire::Bool(*b),
        Value::Int(i) => Wire::Int(*i),
        Value::Float(f) => Wire::Float(*f),
        Value::Complex(r, i) => Wire::Complex(*r, *i),
        Value::Str(s) => Wire::Str(s.clone()),
        Value::Bytes(b) => Wire::Bytes(b.clone()),
        Value::Seq(items) => Wire::Seq(
            items
                .iter()
                .map(|v| to_wire(v, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::Set(items) => Wire::Set(
            items
                .iter()
                .map(|v| to_wire(v, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::FrozenSet(items) => Wire::FrozenSet(
            items
                .iter()
                .map(|v| to_wire(v, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(pairs) => Wire::Map(
            pairs
                .iter()
                .map(|(k, v)| Ok((to_wire(k, ctx)?, to_wire(v, ctx)?)))
                .collect::<Result<_, CodecError>>()?,
        ),
        Value::Record(record) => {
            ctx.resolve(record)?;
            Wire::Reference(WireReference::new(record.gid(), record.kind()))
        }
    })
}

fn from_wire(wire: Wire, ctx: &dyn DecodeContext) -> Value {
    match wire {
        Wire::Null => Value::Null,
        Wire::Bool(b) => Value::Bool(b),
        Wire::Int(i) => Value::Int(i),
        Wire::Float(f) => Value::Float(f),
        Wire::Complex(r, i) => Value::Complex(r, i),
        Wire::Str(s) => Value::Str(s),
        Wire::Bytes(b) => Value::Bytes(b),
        Wire::Seq(items) => Value::Seq(items.into_iter().map(|w| from_wire(w, ctx)).collect()),
        Wire::Set(items) => Value::Set(
            items
                .into_iter()
                .map(|w| from_wire(w, ctx))
                .collect::<ValueSet>(),
        ),
        Wire::FrozenSet(items) => Value::FrozenSet(
            items
                .into_iter()
                .map(|w| from_wire(w, ctx))
                .collect::<ValueSet>(),
        ),
        Wire::Map(pairs) => Value::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (from_wire(k, ctx), from_wire(v, ctx)))
                .collect(),
        ),
        Wire::Reference(r) => {
            let kind = RecordType::new(r.kind_name.as_str());
            Value::Record(ctx.rehydrate(r.gid, kind))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRecords;
    impl EncodeContext for NoRecords {
        fn resolve(&mut self, _record: &Record) -> Result<(), CodecError> {
            unreachable!("no records in these tests")
        }
    }
    impl DecodeContext for NoRecords {
        fn rehydrate(&self, _gid: crate::id::Gid, _kind: RecordType) -> Record {
            unreachable!("no records in these tests")
        }
    }

    fn round_trip(v: Value) -> Value {
        let bytes = encode(&v, &mut NoRecords).unwrap();
        decode(&bytes, &NoRecords).unwrap()
    }

    #[test]
    fn primitives_round_trip() {
        assert_eq!(round_trip(Value::Null), Value::Null);
        assert_eq!(round_trip(Value::Bool(true)), Value::Bool(true));
        assert_eq!(round_trip(Value::Int(-42)), Value::Int(-42));
        assert_eq!(round_trip(Value::Float(1.5)), Value::Float(1.5));
        assert_eq!(round_trip(Value::Complex(1.0, -2.0)), Value::Complex(1.0, -2.0));
        assert_eq!(
            round_trip(Value::Str("nature".into())),
            Value::Str("nature".into())
        );
        assert_eq!(
            round_trip(Value::Bytes(vec![1, 2, 3])),
            Value::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn nested_containers_round_trip() {
        let v = Value::Seq(vec![
            Value::Int(1),
            Value::Map(vec![(Value::Str("k".into()), Value::Bool(false))]),
            Value::Seq(vec![Value::Null]),
        ]);
        assert_eq!(round_trip(v.clone()).to_string(), v.to_string());
    }

    #[test]
    fn sets_round_trip_regardless_of_insertion_order() {
        let a: ValueSet = vec![Value::Int(1), Value::Int(2)].into_iter().collect();
        let b: ValueSet = vec![Value::Int(2), Value::Int(1)].into_iter().collect();
        assert_eq!(round_trip(Value::Set(a)), Value::Set(b));
    }

    #[test]
    fn empty_collections_round_trip() {
        assert_eq!(round_trip(Value::Seq(vec![])), Value::Seq(vec![]));
        assert_eq!(round_trip(Value::Map(vec![])), Value::Map(vec![]));
    }
}

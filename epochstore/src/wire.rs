//! The on-disk tagged graph representation.
//!
//! `Wire` is the `serde`/`rmp-serde` counterpart of `crate::value::Value`:
//! same shape, except record-typed values are `Reference` tokens
//! instead of live handles. `crate::codec` converts between the two,
//! substituting references for records on encode and vice versa on
//! decode.

use crate::{id::Gid, record::RecordType};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) enum Wire {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    Seq(Vec<Wire>),
    Set(Vec<Wire>),
    FrozenSet(Vec<Wire>),
    Map(Vec<(Wire, Wire)>),
    Reference(WireReference),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct WireReference {
    pub gid: Gid,
    pub kind_name: String,
}

impl WireReference {
    pub fn new(gid: Gid, kind: &RecordType) -> Self {
        WireReference {
            gid,
            kind_name: kind.name().to_owned(),
        }
    }
}

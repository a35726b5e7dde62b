#![deny(clippy::all)]

pub mod backend;
pub mod codec;
pub mod id;
pub mod lock;
pub mod manager;
pub mod record;
pub mod value;
mod wire;

pub use backend::{Backend, KvError, Namespace, Put, UnlockOutcome};
pub use codec::{decode, encode, CodecError, DecodeContext, EncodeContext};
pub use id::Gid;
pub use lock::{Lock, LockError, LockGuard};
pub use manager::{DataManager, ManagerError};
pub use record::{Record, RecordBuilder, RecordType};
pub use value::{Reference, Value, ValueSet};

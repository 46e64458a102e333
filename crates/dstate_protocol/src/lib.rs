//! # Disconnected State Protocol
//!
//! Data types shared by every layer of the disconnected synchronization
//! stack, and the binary format used to move an operation log between
//! processes.
//!
//! This crate provides:
//! - [`Key`] and [`TypeTag`] identities, with the temporary/permanent flag
//! - [`FieldValue`] and [`FieldId`] for sparse field tuples
//! - [`VersionInfo`] stamps used for optimistic concurrency
//! - [`Operation`] records and the checkpointed [`OperationLog`]
//! - [`KeyMapping`] from temporary to permanent keys
//! - The length-prefixed log codec ([`encode_log`], [`decode_log`])
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod key;
mod mapping;
mod operation;
mod oplog;
mod value;
mod version;

pub use codec::{
    decode_frames, decode_log, encode_log, DecodedLog, LogFrame, LogHeader, LOG_FORMAT_VERSION,
    LOG_MAGIC,
};
pub use error::{ProtocolError, ProtocolResult};
pub use key::{Key, TemporaryKeyAllocator, TypeTag};
pub use mapping::KeyMapping;
pub use operation::{Operation, OperationKind};
pub use oplog::{CheckpointId, OperationLog};
pub use value::{FieldId, FieldValue};
pub use version::VersionInfo;

//! Custom MongoDB wire protocol driver core.
//!
//! This crate provides the client engine of a MongoDB driver:
//! - Speaks both wire framings (legacy OP_QUERY/OP_REPLY and modern OP_MSG)
//! - Multiplexes concurrent commands over pooled connections, correlating
//!   replies by `responseTo` id
//! - Threads session and transaction metadata through every outgoing command
//!
//! Architecture:
//! - `protocol`: Low-level wire message encoding/decoding
//! - `connection`: Transport ownership, handshake, request correlation
//! - `dispatch`: Framing selection and session/transaction stamping
//! - `session`: Session identifiers and transaction state
//! - `pool`: Class-based connection selection (basic vs. write-capable)
//! - `reply`: Typed command outcomes (counts, per-item write errors)
//! - `metrics`: Optional command timing hook
//! - `namespace`: Database/collection addressing
//! - `error`: Error taxonomy

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod namespace;
pub mod pool;
pub mod protocol;
pub mod reply;
pub mod session;


// Public API re-exports for library consumers
pub use connection::{MongoConfig, MongoConnection, ServerHandshake};
pub use dispatch::{build_request, build_request_with_sequences, CommandMetadata};
pub use error::{MongoError, MongoResult};
pub use metrics::{CommandTimer, NoopTimer};
pub use namespace::MongoNamespace;
pub use pool::{ConnectionClass, MongoPool, MongoPoolConfig};
pub use protocol::{
    ClientRequest, DocumentSequence, MessageHeader, MessageSection, OpCode, OpMessage, OpQuery,
    OpReply, ServerReply, OP_MSG_MIN_WIRE_VERSION,
};
pub use reply::{WriteError, WriteReply};
pub use session::{MongoSession, MongoTransaction, SessionIdentifier};

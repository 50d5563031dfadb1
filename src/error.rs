//! Error types for the MongoDB wire protocol implementation.

use std::io;

use thiserror::Error;

/// Result type for driver operations.
pub type MongoResult<T> = Result<T, MongoError>;

/// Errors that can occur while framing, dispatching or correlating commands.
#[derive(Error, Debug)]
pub enum MongoError {
    /// I/O error during communication. Fails every operation outstanding on
    /// the connection and retires it from the pool.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A command value could not be turned into a document. Nothing was sent.
    #[error("Unable to encode command: {0}")]
    Encode(#[from] bson::ser::Error),

    /// A reply body could not be mapped to the requested type. The
    /// connection remains usable.
    #[error("Unable to decode reply: {0}")]
    Decode(#[from] bson::de::Error),

    /// Protocol error (unexpected opcode, malformed frame, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The correlated reply carried the wrong tag for the framing that was
    /// sent. Fatal to the single operation only; never retried here.
    #[error("Unexpected reply type, expected {expected}")]
    InvalidReplyType { expected: &'static str },

    /// The server handshake failed or has not been performed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Connection is closed or in an invalid state.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The connection's negotiated wire version predates transactions.
    #[error("The connection's wire version does not support transactions")]
    TransactionsUnsupported,

    /// The session already has an unfinished transaction.
    #[error("A transaction is already in progress on this session")]
    TransactionInProgress,

    /// The transaction was already committed or aborted.
    #[error("The transaction has already been committed or aborted")]
    TransactionFinished,

    /// The pool holds connections, but none to a node accepting writes.
    #[error("No connection to a writable node is available")]
    NoWritableConnection,

    /// The pool cannot hand out or create any further connections.
    #[error("Connection pool is exhausted")]
    PoolExhausted,

    /// The pool has been shut down.
    #[error("Connection pool is closed")]
    PoolClosed,
}

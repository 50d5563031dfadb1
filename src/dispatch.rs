//! Command dispatch: framing selection and session/transaction stamping.
//!
//! [`build_request`] is a pure function from a command envelope to a framed
//! request, so the stamping rules are testable without a transport. The
//! `execute_*` methods on [`MongoConnection`] wrap it with transmission and
//! timing.

use std::panic::Location;
use std::time::Instant;

use bson::Document;
use serde::{Deserialize, Serialize};
use tracing::{error, info, trace};

use crate::connection::{MongoConnection, ServerHandshake};
use crate::error::{MongoError, MongoResult};
use crate::namespace::MongoNamespace;
use crate::protocol::{ClientRequest, DocumentSequence, OpMessage, OpQuery, ServerReply};
use crate::session::{MongoTransaction, SessionIdentifier};

// ============================================================================
// Command Metadata
// ============================================================================

/// Diagnostic provenance of a command, used for logging and tracing only.
/// Carries no protocol semantics and never affects wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    pub file: String,
    pub line: u32,
}

impl CommandMetadata {
    /// Capture the call site of the invoking function.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file().to_string(),
            line: location.line(),
        }
    }
}

// ============================================================================
// Request construction
// ============================================================================

/// Choose the wire framing from the connection's negotiated capability and
/// stamp namespace, session and transaction metadata into the command.
///
/// Modern framing targets the database through the `$db` field; legacy
/// framing addresses `"<database>.$cmd"` through the collection name
/// instead. A transaction on a legacy connection is an error: that framing
/// predates transactions and must never carry transaction fields.
pub fn build_request(
    command: Document,
    namespace: &MongoNamespace,
    handshake: &ServerHandshake,
    session_id: Option<&SessionIdentifier>,
    transaction: Option<&MongoTransaction>,
) -> MongoResult<ClientRequest> {
    build_request_with_sequences(command, namespace, handshake, session_id, transaction, Vec::new())
}

/// Like [`build_request`], with named document sequences batched alongside
/// the command body (e.g. the documents of a bulk insert). Sequences need
/// modern framing; the legacy format has nowhere to carry them.
pub fn build_request_with_sequences(
    mut command: Document,
    namespace: &MongoNamespace,
    handshake: &ServerHandshake,
    session_id: Option<&SessionIdentifier>,
    transaction: Option<&MongoTransaction>,
    sequences: Vec<DocumentSequence>,
) -> MongoResult<ClientRequest> {
    if handshake.supports_op_msg() {
        trace!("Forming OpMessage");

        command.insert("$db", namespace.database_name());

        if let Some(id) = session_id {
            command.insert("lsid", id.to_document());
        }

        if let Some(transaction) = transaction {
            if transaction.is_finished() {
                return Err(MongoError::TransactionFinished);
            }

            command.insert("txnNumber", transaction.number());
            command.insert("autocommit", transaction.autocommit());

            if transaction.claim_start() {
                command.insert("startTransaction", true);
                info!(number = transaction.number(), "Starting transaction");
            }
        }

        // The request id is assigned by the connection just before
        // transmission.
        Ok(ClientRequest::Message(OpMessage::with_sequences(
            command, sequences, 0,
        )))
    } else {
        trace!("Forming OpQuery");

        if transaction.is_some() {
            return Err(MongoError::TransactionsUnsupported);
        }
        if !sequences.is_empty() {
            return Err(MongoError::Protocol(
                "Document sequences require OP_MSG framing".to_string(),
            ));
        }

        if let Some(id) = session_id {
            command.insert("lsid", id.to_document());
        }

        let full_collection_name = format!("{}.$cmd", namespace.database_name());
        Ok(ClientRequest::Query(OpQuery::new(
            command,
            0,
            full_collection_name,
        )))
    }
}

// ============================================================================
// Connection-level dispatch
// ============================================================================

impl MongoConnection {
    /// Serialize a typed command through the document codec and dispatch it.
    ///
    /// Encoding failures surface immediately, before any network activity.
    pub async fn execute_encodable<C: Serialize>(
        &self,
        command: &C,
        namespace: &MongoNamespace,
        transaction: Option<&MongoTransaction>,
        session_id: Option<&SessionIdentifier>,
        metadata: Option<CommandMetadata>,
    ) -> MongoResult<ServerReply> {
        let document = match bson::to_document(command) {
            Ok(document) => document,
            Err(err) => {
                error!("Unable to encode command: {}", err);
                return Err(err.into());
            }
        };

        self.execute_command(document, namespace, transaction, session_id, metadata)
            .await
    }

    /// Dispatch a command document: select framing, stamp metadata, send,
    /// and await the matching reply. Falls back to the connection's
    /// implicit session when the caller supplies none.
    pub async fn execute_command(
        &self,
        command: Document,
        namespace: &MongoNamespace,
        transaction: Option<&MongoTransaction>,
        session_id: Option<&SessionIdentifier>,
        metadata: Option<CommandMetadata>,
    ) -> MongoResult<ServerReply> {
        self.execute_command_with_sequences(
            command,
            namespace,
            transaction,
            session_id,
            metadata,
            Vec::new(),
        )
        .await
    }

    /// Dispatch a command with batched document sequences.
    pub async fn execute_command_with_sequences(
        &self,
        command: Document,
        namespace: &MongoNamespace,
        transaction: Option<&MongoTransaction>,
        session_id: Option<&SessionIdentifier>,
        metadata: Option<CommandMetadata>,
        sequences: Vec<DocumentSequence>,
    ) -> MongoResult<ServerReply> {
        if let Some(metadata) = &metadata {
            trace!(file = %metadata.file, line = metadata.line, "Dispatching command");
        }

        let session_id = session_id.unwrap_or_else(|| self.implicit_session_id());

        // Capability never changes for a connection's lifetime, but pooled
        // connections may differ, so the framing decision is made per call.
        let request = build_request_with_sequences(
            command,
            namespace,
            self.server_handshake()?,
            Some(session_id),
            transaction,
            sequences,
        )?;

        let started = Instant::now();
        let result = match request {
            ClientRequest::Message(message) => self
                .execute_op_message(message)
                .await
                .map(ServerReply::Message),
            ClientRequest::Query(query) => {
                self.execute_op_query(query).await.map(ServerReply::Reply)
            }
        };
        self.command_timer().record(started.elapsed());

        result
    }
}

//! Session identifiers and transaction state.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Document};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{MongoError, MongoResult};

// ============================================================================
// Session Identifier
// ============================================================================

/// Opaque token identifying a server-side session.
///
/// Explicit identifiers are owned by a [`MongoSession`] and may outlive any
/// single connection; implicit identifiers are created lazily by a
/// connection and die with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentifier {
    id: Binary,
}

impl SessionIdentifier {
    pub fn random() -> Self {
        Self {
            id: Binary {
                subtype: BinarySubtype::Uuid,
                bytes: Uuid::new_v4().as_bytes().to_vec(),
            },
        }
    }

    /// The token bytes as they appear on the wire.
    pub fn token(&self) -> &[u8] {
        &self.id.bytes
    }

    /// The `lsid` value stamped into outgoing commands.
    pub(crate) fn to_document(&self) -> Document {
        doc! { "id": self.id.clone() }
    }
}

// ============================================================================
// Transaction
// ============================================================================

const TXN_NOT_STARTED: u8 = 0;
const TXN_STARTED: u8 = 1;
const TXN_COMMITTED: u8 = 2;
const TXN_ABORTED: u8 = 3;

/// An atomic multi-command unit of work scoped to a session.
///
/// Cloning yields another handle onto the same transaction; the state is
/// shared so that concurrent dispatchers agree on who stamps
/// `startTransaction`.
#[derive(Debug, Clone)]
pub struct MongoTransaction {
    number: i64,
    autocommit: bool,
    state: Arc<AtomicU8>,
}

impl MongoTransaction {
    pub fn new(number: i64, autocommit: bool) -> Self {
        Self {
            number,
            autocommit,
            state: Arc::new(AtomicU8::new(TXN_NOT_STARTED)),
        }
    }

    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Claims the one-time right to stamp `startTransaction`.
    ///
    /// Returns `true` for exactly one caller over the transaction's entire
    /// lifetime; a retried or concurrent dispatch sees `false` and sends
    /// only the transaction number and autocommit flag.
    pub(crate) fn claim_start(&self) -> bool {
        self.state
            .compare_exchange(
                TXN_NOT_STARTED,
                TXN_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) != TXN_NOT_STARTED
    }

    /// Whether the transaction reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state.load(Ordering::Acquire),
            TXN_COMMITTED | TXN_ABORTED
        )
    }

    /// Record the outcome of an explicit `commitTransaction` command.
    pub fn mark_committed(&self) {
        self.state.store(TXN_COMMITTED, Ordering::Release);
    }

    /// Record the outcome of an explicit `abortTransaction` command.
    pub fn mark_aborted(&self) {
        self.state.store(TXN_ABORTED, Ordering::Release);
    }
}

// ============================================================================
// Explicit Session
// ============================================================================

/// A caller-managed session.
///
/// Mints monotonically increasing transaction numbers and allows at most
/// one unfinished transaction at a time. May be reattached to any
/// connection; its transactions must never be reused on another session.
pub struct MongoSession {
    id: SessionIdentifier,
    last_transaction_number: AtomicI64,
    active_transaction: Mutex<Option<MongoTransaction>>,
}

impl MongoSession {
    pub fn new() -> Self {
        Self {
            id: SessionIdentifier::random(),
            last_transaction_number: AtomicI64::new(0),
            active_transaction: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionIdentifier {
        &self.id
    }

    /// Begin a new transaction on this session.
    ///
    /// Fails while a previous transaction is still unfinished.
    pub fn start_transaction(&self, autocommit: bool) -> MongoResult<MongoTransaction> {
        let mut active = self.active_transaction.lock();
        if let Some(transaction) = active.as_ref() {
            if !transaction.is_finished() {
                return Err(MongoError::TransactionInProgress);
            }
        }

        let number = self.last_transaction_number.fetch_add(1, Ordering::Relaxed) + 1;
        let transaction = MongoTransaction::new(number, autocommit);
        *active = Some(transaction.clone());
        Ok(transaction)
    }
}

impl Default for MongoSession {
    fn default() -> Self {
        Self::new()
    }
}

//! Database and collection addressing.

/// The `(database, collection)` addressing unit for a command.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MongoNamespace {
    database: String,
    collection: String,
}

impl MongoNamespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// The namespace command documents for a database are addressed to.
    pub fn command_namespace(database: impl Into<String>) -> Self {
        Self::new(database, "$cmd")
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Fully qualified `"<database>.<collection>"` string, as used by the
    /// legacy framing's collection name field.
    pub fn full_collection_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::operations::types::{MigrationError, MigrationResult};

/// Database holding the cluster metadata itself. Never replicated.
pub const CONFIG_DATABASE: &str = "config";

/// `database.collection` pair.
///
/// The collection part may itself contain dots (`db.system.users`), so parsing splits at the
/// first dot only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_config(&self) -> bool {
        self.database == CONFIG_DATABASE
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((database, collection)) if !database.is_empty() && !collection.is_empty() => {
                Ok(Self::new(database, collection))
            }
            _ => Err(MigrationError::bad_input(format!(
                "`{s}` is not a namespace, expected `database.collection`"
            ))),
        }
    }
}

impl TryFrom<String> for Namespace {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

/// Scope of a migration run.
///
/// With no entries configured everything is in scope. Otherwise a namespace is in scope iff it is
/// listed explicitly or its database is listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceFilter {
    include_namespaces: BTreeSet<Namespace>,
    include_databases: BTreeSet<String>,
}

impl NamespaceFilter {
    pub fn new(
        include_namespaces: impl IntoIterator<Item = Namespace>,
        include_databases: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            include_namespaces: include_namespaces.into_iter().collect(),
            include_databases: include_databases.into_iter().collect(),
        }
    }

    /// Build the filter from operator entries: `db.coll` is a namespace, anything else a database.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> MigrationResult<Self> {
        let mut filter = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            if entry.contains('.') {
                filter.include_namespaces.insert(entry.parse()?);
            } else {
                filter.include_databases.insert(entry.to_string());
            }
        }
        Ok(filter)
    }

    pub fn is_filtered(&self) -> bool {
        !self.include_namespaces.is_empty() || !self.include_databases.is_empty()
    }

    pub fn included(&self, ns: &Namespace) -> bool {
        if !self.is_filtered() {
            return true;
        }
        self.include_namespaces.contains(ns) || self.include_databases.contains(ns.database())
    }

    /// Whether sharding has to be enabled for `database`.
    ///
    /// Databases of explicitly listed namespaces count as in scope here.
    pub fn database_included(&self, database: &str) -> bool {
        if !self.is_filtered() {
            return true;
        }
        self.include_databases.contains(database)
            || self
                .include_namespaces
                .iter()
                .any(|ns| ns.database() == database)
    }

    /// Whether every collection of `database` is in scope, which destructive database-level
    /// operations such as drop require. A listed namespace does not widen to its database.
    pub fn whole_database_included(&self, database: &str) -> bool {
        !self.is_filtered() || self.include_databases.contains(database)
    }

    pub fn include_namespaces(&self) -> &BTreeSet<Namespace> {
        &self.include_namespaces
    }

    pub fn include_databases(&self) -> &BTreeSet<String> {
        &self.include_databases
    }
}

//! Shared in-memory tables with a statement log.

use orm_core::{LockMode, Value};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

/// One executed operation, recorded in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Insert { entity: String, id: Value },
    Update { entity: String, id: Value },
    Delete { entity: String, id: Value },
    Select { entity: String, id: Value },
    Lock { entity: String, id: Value, mode: LockMode },
    IncrementVersion { entity: String, id: Value },
    CollectionSelect { role: String, key: Value },
    CollectionRecreate { role: String, key: Value },
    CollectionRemove { role: String, key: Value },
    CollectionInsertRows { role: String, key: Value, count: usize },
    CollectionDeleteRows { role: String, key: Value, count: usize },
}

impl Statement {
    /// Short name of the statement type.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "insert",
            Statement::Update { .. } => "update",
            Statement::Delete { .. } => "delete",
            Statement::Select { .. } => "select",
            Statement::Lock { .. } => "lock",
            Statement::IncrementVersion { .. } => "increment-version",
            Statement::CollectionSelect { .. } => "collection-select",
            Statement::CollectionRecreate { .. } => "collection-recreate",
            Statement::CollectionRemove { .. } => "collection-remove",
            Statement::CollectionInsertRows { .. } => "collection-insert-rows",
            Statement::CollectionDeleteRows { .. } => "collection-delete-rows",
        }
    }
}

/// A stored entity row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Concrete entity name.
    pub entity_name: String,
    pub state: Vec<Value>,
    pub version: Value,
}

/// Identifier wrapper usable as a map key.
#[derive(Debug, Clone)]
pub(crate) struct RowKey(pub(crate) Value);

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.same_identifier(&other.0)
    }
}

impl Eq for RowKey {}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_into(state);
    }
}

#[derive(Debug, Default)]
pub(crate) struct DatabaseState {
    /// Root entity name -> rows keyed by identifier, in insertion order.
    pub(crate) tables: HashMap<String, Vec<(RowKey, StoredRow)>>,
    /// Collection role -> (owner key, element) rows.
    pub(crate) collections: HashMap<String, Vec<(Value, Value)>>,
    pub(crate) sequences: HashMap<String, i64>,
    pub(crate) log: Vec<Statement>,
    pub(crate) failing: Vec<String>,
}

impl DatabaseState {
    pub(crate) fn row(&self, table: &str, id: &Value) -> Option<&StoredRow> {
        let key = RowKey(id.clone());
        self.tables
            .get(table)?
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, row)| row)
    }

    pub(crate) fn row_mut(&mut self, table: &str, id: &Value) -> Option<&mut StoredRow> {
        let key = RowKey(id.clone());
        self.tables
            .get_mut(table)?
            .iter_mut()
            .find(|(k, _)| *k == key)
            .map(|(_, row)| row)
    }

    pub(crate) fn put(&mut self, table: &str, id: &Value, row: StoredRow) {
        let key = RowKey(id.clone());
        let rows = self.tables.entry(table.to_string()).or_default();
        match rows.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = row,
            None => rows.push((key, row)),
        }
    }

    pub(crate) fn remove(&mut self, table: &str, id: &Value) -> Option<StoredRow> {
        let key = RowKey(id.clone());
        let rows = self.tables.get_mut(table)?;
        let index = rows.iter().position(|(k, _)| *k == key)?;
        Some(rows.remove(index).1)
    }

    pub(crate) fn next_id(&mut self, table: &str) -> i64 {
        let next = self.sequences.entry(table.to_string()).or_insert(0);
        *next += 1;
        *next
    }

    pub(crate) fn should_fail(&self, kind: &str, name: &str) -> bool {
        self.failing
            .iter()
            .any(|f| f == &format!("{kind}:{name}") || f == kind)
    }
}

/// Process-local storage shared by every memory persister of a factory.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Mutex<DatabaseState>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Current row of `table` (a root entity name) for `id`.
    pub fn row(&self, table: &str, id: &Value) -> Option<StoredRow> {
        self.lock().row(table, id).cloned()
    }

    /// Number of rows in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, Vec::len)
    }

    /// Write a row directly, as another transaction would.
    pub fn put_row(&self, table: &str, id: &Value, row: StoredRow) {
        self.lock().put(table, id, row);
    }

    /// Delete a row directly, as another transaction would.
    pub fn delete_row(&self, table: &str, id: &Value) -> Option<StoredRow> {
        self.lock().remove(table, id)
    }

    /// Overwrite the version of a row directly, as another transaction would.
    pub fn set_version(&self, table: &str, id: &Value, version: Value) -> bool {
        match self.lock().row_mut(table, id) {
            Some(row) => {
                row.version = version;
                true
            }
            None => false,
        }
    }

    /// Elements of the collection `role` owned by `key`.
    pub fn collection_rows(&self, role: &str, key: &Value) -> Vec<Value> {
        self.lock()
            .collections
            .get(role)
            .map(|rows| {
                rows.iter()
                    .filter(|(owner, _)| owner.same_identifier(key))
                    .map(|(_, element)| element.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every statement executed so far.
    pub fn statements(&self) -> Vec<Statement> {
        self.lock().log.clone()
    }

    /// Number of executed statements of a kind (see [`Statement::kind`]).
    pub fn count(&self, kind: &str) -> usize {
        self.lock().log.iter().filter(|s| s.kind() == kind).count()
    }

    /// Forget the statement log.
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Make statements of `kind` fail, for every entity or only `name`.
    pub fn fail_on(&self, kind: &str, name: Option<&str>) {
        let rule = match name {
            Some(name) => format!("{kind}:{name}"),
            None => kind.to_string(),
        };
        self.lock().failing.push(rule);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }
}

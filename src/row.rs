//! Rows and result sets.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::backend::query::rows_affected;
use crate::protocol::types::Oid;
use crate::value::{FromValue, Value};

/// Column metadata from a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    type_oid: Oid,
}

impl Column {
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            type_oid,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }
}

/// Anything that selects a column: a zero-based index or a column name.
pub trait ColumnIndex {
    fn position(&self, columns: &[Column]) -> Option<usize>;
}

impl ColumnIndex for usize {
    fn position(&self, columns: &[Column]) -> Option<usize> {
        (*self < columns.len()).then_some(*self)
    }
}

impl ColumnIndex for &str {
    fn position(&self, columns: &[Column]) -> Option<usize> {
        columns.iter().position(|c| c.name == *self)
    }
}

/// One row of a result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value of a column, if it exists.
    pub fn value<I: ColumnIndex>(&self, index: I) -> Option<&Value> {
        index
            .position(&self.columns)
            .and_then(|i| self.values.get(i))
    }

    /// Read a column as `T`.
    ///
    /// ```no_run
    /// # fn demo(row: &pgnx::Row) -> pgnx::Result<()> {
    /// let name: String = row.get("name")?;
    /// let age: Option<i32> = row.get(1)?;
    /// # Ok(()) }
    /// ```
    pub fn get<'a, T: FromValue<'a>, I: ColumnIndex + std::fmt::Debug>(
        &'a self,
        index: I,
    ) -> Result<T> {
        let value = index
            .position(&self.columns)
            .and_then(|i| self.values.get(i))
            .ok_or_else(|| Error::InvalidUsage(format!("no such column: {:?}", index)))?;
        T::decode(value)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Outcome of one statement: its rows (possibly none) and command tag.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    columns: Arc<[Column]>,
    rows: Vec<Row>,
    command_tag: String,
}

impl QueryResult {
    pub fn new(columns: Arc<[Column]>, rows: Vec<Row>, command_tag: impl Into<String>) -> Self {
        Self {
            columns,
            rows,
            command_tag: command_tag.into(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Command tag reported by the server, e.g. `UPDATE 1`. Empty for an empty query.
    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    /// Rows inserted, updated, deleted, selected or copied, per the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        rows_affected(&self.command_tag)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl IntoIterator for QueryResult {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;

    fn sample() -> QueryResult {
        let columns: Arc<[Column]> =
            vec![Column::new("name", oid::TEXT), Column::new("age", oid::INT4)].into();
        let rows = vec![
            Row::new(columns.clone(), vec!["Alice".into(), 25.into()]),
            Row::new(columns.clone(), vec!["Bob".into(), Value::Null]),
        ];
        QueryResult::new(columns, rows, "SELECT 2")
    }

    #[test]
    fn typed_access_by_name_and_index() {
        let result = sample();
        let alice = &result.rows()[0];
        assert_eq!(alice.get::<String, _>("name").unwrap(), "Alice");
        assert_eq!(alice.get::<i32, _>(1).unwrap(), 25);

        let bob = &result.rows()[1];
        assert_eq!(bob.get::<Option<i32>, _>("age").unwrap(), None);
        assert!(bob.get::<i32, _>("age").is_err());
        assert!(bob.get::<i32, _>("missing").is_err());
        assert!(bob.get::<i32, _>(7).is_err());
    }

    #[test]
    fn rows_affected_from_tag() {
        assert_eq!(sample().rows_affected(), Some(2));
        let ddl = QueryResult::new(Arc::from(Vec::new()), Vec::new(), "CREATE TABLE");
        assert_eq!(ddl.rows_affected(), None);
        assert!(ddl.is_empty());
    }
}

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{DataType, Value};

/// A column name. Names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Column(String);

impl Column {
    pub fn new(name: impl AsRef<str>) -> Self {
        Column(name.as_ref().trim().to_ascii_uppercase())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<String> for Column {
    fn from(name: String) -> Self {
        Column::new(name)
    }
}

impl From<&str> for Column {
    fn from(name: &str) -> Self {
        Column::new(name)
    }
}

impl From<Column> for String {
    fn from(column: Column) -> Self {
        column.0
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowKind {
    /// Snapshot of existing data
    Select,
    Insert,
    Update,
    Delete,
}

/// One row of tabular data
#[derive(Debug, Clone)]
pub struct Row {
    kind: RowKind,
    columns: Arc<Vec<Column>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(kind: RowKind, columns: Arc<Vec<Column>>, values: Vec<Value>) -> Self {
        Self {
            kind,
            columns,
            values,
        }
    }

    pub fn kind(&self) -> RowKind {
        self.kind
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn has_column(&self, column: &Column) -> bool {
        self.columns.contains(column)
    }

    pub fn has_columns(&self, columns: &[Column]) -> bool {
        !columns.is_empty() && columns.iter().all(|c| self.has_column(c))
    }

    /// Raw value of a column, `None` if the row does not carry it
    pub fn value(&self, column: &Column) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)
    }

    /// Value of a column converted to the given type. Missing columns read as
    /// null.
    pub fn value_as(&self, column: &Column, data_type: Option<DataType>) -> Value {
        let value = self.value(column).cloned().unwrap_or_default();
        match data_type {
            Some(data_type) => value.coerce(data_type),
            None => value,
        }
    }

    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

/// Source of rows. Implementations should release their resources on
/// `close`, which may be called more than once.
pub trait TabularData: Send {
    fn columns(&self) -> Vec<Column>;

    fn next_row(&mut self) -> Result<Option<Row>>;

    fn close(&mut self);

    /// Short description for log messages
    fn describe(&self) -> String {
        format!("tabular data [{}]", self.columns().len())
    }
}

/// Rows held in memory
#[derive(Debug, Clone)]
pub struct MemoryTabularData {
    description: String,
    columns: Arc<Vec<Column>>,
    rows: VecDeque<(RowKind, Vec<Value>)>,
    closed: bool,
}

impl MemoryTabularData {
    pub fn new<C: Into<Column>>(
        description: impl Into<String>,
        columns: impl IntoIterator<Item = C>,
    ) -> Self {
        Self {
            description: description.into(),
            columns: Arc::new(columns.into_iter().map(Into::into).collect()),
            rows: VecDeque::new(),
            closed: false,
        }
    }

    pub fn with_row(mut self, kind: RowKind, values: Vec<Value>) -> Self {
        self.push_row(kind, values);
        self
    }

    pub fn push_row(&mut self, kind: RowKind, values: Vec<Value>) {
        self.rows.push_back((kind, values));
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl TabularData for MemoryTabularData {
    fn columns(&self) -> Vec<Column> {
        self.columns.as_ref().clone()
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self
            .rows
            .pop_front()
            .map(|(kind, values)| Row::new(kind, self.columns.clone(), values)))
    }

    fn close(&mut self) {
        self.closed = true;
        self.rows.clear();
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_are_case_insensitive() {
        assert_eq!(Column::new("instrument_id"), Column::new("INSTRUMENT_ID"));
    }

    #[test]
    fn test_memory_rows_and_close() {
        let mut data = MemoryTabularData::new("trades", ["ID", "QUANTITY"])
            .with_row(RowKind::Select, vec![Value::Int(1), Value::from("10")])
            .with_row(RowKind::Select, vec![Value::Int(2), Value::from("20")]);

        let row = data.next_row().unwrap().unwrap();
        assert_eq!(row.value(&Column::new("id")), Some(&Value::Int(1)));
        assert_eq!(
            row.value_as(&Column::new("quantity"), Some(DataType::Integer)),
            Value::Int(10)
        );
        assert!(row.value(&Column::new("PRICE")).is_none());
        assert!(row.has_columns(&[Column::new("ID")]));
        assert!(!row.has_columns(&[]));

        data.close();
        assert!(data.is_closed());
        assert!(data.next_row().unwrap().is_none());
    }
}

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::model::{
    key_from_row, Column, Key, MemoryTabularData, Row, RowKind, Schema, TabularData, TypeName,
    Value,
};

/// Supplier of rows for tabular bean factories
pub trait TabularDataSource: Send + Sync {
    /// Rows whose key columns hold the given key
    fn select_by_key(
        &self,
        schema: &Schema,
        columns: &[Column],
        key: &Key,
    ) -> Result<Box<dyn TabularData>>;

    /// Every row for a type
    fn select_all(&self, schema: &Schema) -> Result<Box<dyn TabularData>>;
}

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

/// In-memory tables keyed by bean type, mainly for tests and demos
#[derive(Default)]
pub struct MemoryDataSource {
    tables: RwLock<HashMap<TypeName, MemoryTable>>,
    selects: AtomicUsize,
    latency: RwLock<Option<Duration>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table<C: Into<Column>>(&self, type_name: &str, columns: impl IntoIterator<Item = C>) {
        self.tables.write().insert(
            type_name.to_string(),
            MemoryTable {
                columns: columns.into_iter().map(Into::into).collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn insert(&self, type_name: &str, values: Vec<Value>) {
        if let Some(table) = self.tables.write().get_mut(type_name) {
            table.rows.push(values);
        }
    }

    /// Number of selects served so far
    pub fn select_count(&self) -> usize {
        self.selects.load(Ordering::SeqCst)
    }

    /// Delay every select, to widen race windows in tests
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    fn select(
        &self,
        schema: &Schema,
        filter: impl Fn(&Row) -> bool,
    ) -> Result<Box<dyn TabularData>> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = *self.latency.read() {
            std::thread::sleep(latency);
        }

        let tables = self.tables.read();
        let Some(table) = tables.get(&schema.type_name) else {
            anyhow::bail!("no table for type '{}'", schema.type_name);
        };

        let description = format!("select from {}", schema.type_name);
        let mut data = MemoryTabularData::new(description, table.columns.clone());
        let columns = std::sync::Arc::new(table.columns.clone());
        for values in &table.rows {
            let row = Row::new(RowKind::Select, columns.clone(), values.clone());
            if filter(&row) {
                data.push_row(RowKind::Select, values.clone());
            }
        }
        Ok(Box::new(data))
    }
}

impl TabularDataSource for MemoryDataSource {
    fn select_by_key(
        &self,
        schema: &Schema,
        columns: &[Column],
        key: &Key,
    ) -> Result<Box<dyn TabularData>> {
        self.select(schema, |row| key_from_row(schema, row, columns).as_ref() == Some(key))
    }

    fn select_all(&self, schema: &Schema) -> Result<Box<dyn TabularData>> {
        self.select(schema, |_| true)
    }
}

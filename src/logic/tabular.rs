use anyhow::anyhow;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::logic::{inflate_rows, BeanFactory, BeanFactoryType, BeanLoader};
use crate::model::{BeanRef, Cached, CriterionGroup, DataLevel, Key, Schema, TabularData};
use crate::store::TabularDataSource;

pub const TABULAR_FACTORY_TYPE: &str = "tabular";

/// Factories that load rows from named tabular data sources
pub struct TabularBeanFactoryType {
    name: String,
    sources: RwLock<HashMap<String, Arc<dyn TabularDataSource>>>,
}

impl TabularBeanFactoryType {
    pub fn new() -> Self {
        Self::named(TABULAR_FACTORY_TYPE)
    }

    /// A tabular kind registered under another name, for schemas whose rows
    /// come from a different family of sources
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sources: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_source(self, data_source: &str, source: Arc<dyn TabularDataSource>) -> Self {
        self.add_source(data_source, source);
        self
    }

    pub fn add_source(&self, data_source: &str, source: Arc<dyn TabularDataSource>) {
        self.sources.write().insert(data_source.to_string(), source);
    }
}

impl Default for TabularBeanFactoryType {
    fn default() -> Self {
        Self::new()
    }
}

impl BeanFactoryType for TabularBeanFactoryType {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_loader(
        &self,
        schema: &Arc<Schema>,
        data_source: &str,
    ) -> Result<Arc<dyn BeanLoader>> {
        let source = self.sources.read().get(data_source).cloned().ok_or_else(|| {
            CacheError::Source(anyhow!(
                "no tabular data source '{}' for {}",
                data_source,
                schema.type_name
            ))
        })?;
        Ok(Arc::new(TabularLoader::new(source)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Executed {
    All,
    ByKey(Option<String>, Key),
}

/// Loads a factory's misses from a tabular data source. Low quantity types
/// are read whole; others are read by key.
pub struct TabularLoader {
    source: Arc<dyn TabularDataSource>,
    /// Selects already run for low quantity, low volatility types since the
    /// load stack last reset
    executed: Mutex<HashSet<Executed>>,
}

impl TabularLoader {
    pub fn new(source: Arc<dyn TabularDataSource>) -> Self {
        Self {
            source,
            executed: Mutex::new(HashSet::new()),
        }
    }

    /// Select and inflate rows under the hierarchy lock. For static types a
    /// select is remembered once its first pass succeeds and is not run again;
    /// `None` means it was skipped.
    fn inflate<S>(
        &self,
        factory: &BeanFactory,
        executed: Executed,
        select: S,
    ) -> Result<Option<Vec<BeanRef>>>
    where
        S: FnOnce() -> Result<Box<dyn TabularData>>,
    {
        let remembered = factory.schema().is_low_quantity_and_volatility();
        inflate_rows(
            factory,
            || {
                if remembered && self.executed.lock().contains(&executed) {
                    return Ok(None);
                }
                select().map(Some)
            },
            || {
                if remembered {
                    self.executed.lock().insert(executed.clone());
                }
            },
        )
    }

    fn select(
        &self,
        factory: &BeanFactory,
        key: &Key,
        index: Option<&str>,
    ) -> Result<Option<Vec<BeanRef>>> {
        let schema = factory.schema();
        if schema.data_quantity == DataLevel::Low {
            return self.inflate(factory, Executed::All, || Ok(self.source.select_all(schema)?));
        }

        let columns = schema.key_columns(index)?;
        self.inflate(
            factory,
            Executed::ByKey(index.map(str::to_string), key.clone()),
            || Ok(self.source.select_by_key(schema, &columns, key)?),
        )
    }
}

impl BeanLoader for TabularLoader {
    fn load(&self, factory: &BeanFactory, key: &Key, index: Option<&str>) -> Result<Cached> {
        // A skipped select already ran to completion under the lock, so
        // whatever it found is in the store
        let beans = self.select(factory, key, index)?.unwrap_or_else(|| {
            debug!("{}already selected, not loading {}", factory.log_prefix(), key);
            Vec::new()
        });
        factory.loaded_value(key, index, &beans)
    }

    fn get_objects(
        &self,
        factory: &BeanFactory,
        criteria: &CriterionGroup,
    ) -> Result<Vec<BeanRef>> {
        let selected = self.inflate(factory, Executed::All, || {
            Ok(self.source.select_all(factory.schema())?)
        })?;
        let beans = match selected {
            Some(beans) => beans,
            None => {
                let _guard = factory.lock();
                factory
                    .values()
                    .into_iter()
                    .filter_map(|v| v.as_bean().cloned())
                    .collect()
            }
        };
        Ok(beans
            .into_iter()
            .filter(|bean| factory.accepts(bean.type_name()) && criteria.evaluate(bean))
            .collect())
    }

    fn clear_impl(&self, _factory: &BeanFactory) {
        self.executed.lock().clear();
    }

    fn reset_load_stack(&self) {
        self.executed.lock().clear();
    }
}

use log::{debug, error, info};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::logic::properties::{CachedColumns, PropertyRun};
use crate::logic::{BeanFactory, BeanFactoryRegistry, EventQueue};
use crate::model::{
    key_from_row, Bean, BeanId, BeanRef, Cached, Column, Key, MapEventKind, Property, Row, RowKind,
    Schema, TabularData, TypeName,
};

/// Beans touched by one batch of rows, in the order their keys were first
/// seen, and the change events they raise
#[derive(Default)]
pub(crate) struct KeysBeansAndEvents {
    order: Vec<Key>,
    beans: HashMap<Key, BeanRef>,
    created: Vec<BeanRef>,
    created_ids: HashSet<BeanId>,
    reused: HashSet<BeanId>,
    inserted: Vec<BeanRef>,
    updated: Vec<BeanRef>,
    found: Vec<BeanRef>,
    deleted: Vec<BeanRef>,
    events: Vec<(MapEventKind, Key, BeanRef)>,
}

impl KeysBeansAndEvents {
    pub(crate) fn contains_key(&self, key: &Key) -> bool {
        self.beans.contains_key(key)
    }

    fn record(&mut self, key: Key, bean: BeanRef) {
        if self.beans.insert(key.clone(), bean).is_none() {
            self.order.push(key);
        }
    }

    pub(crate) fn add_created(&mut self, key: Key, bean: BeanRef, insert: bool) {
        self.created_ids.insert(bean.id());
        self.created.push(bean.clone());
        if insert {
            self.inserted.push(bean.clone());
            self.events.push((MapEventKind::Insert, key.clone(), bean.clone()));
        }
        self.record(key, bean);
    }

    pub(crate) fn add_reused(&mut self, bean: &BeanRef) {
        self.reused.insert(bean.id());
    }

    pub(crate) fn add_updated(&mut self, key: Key, bean: BeanRef) {
        if !self.updated.iter().any(|b| b.id() == bean.id()) {
            self.updated.push(bean.clone());
        }
        self.events.push((MapEventKind::Update, key.clone(), bean.clone()));
        self.record(key, bean);
    }

    /// Beans created by this batch are not also found
    pub(crate) fn add_found(&mut self, key: Key, bean: BeanRef) {
        if self.created_ids.contains(&bean.id()) {
            return;
        }
        self.found.push(bean.clone());
        self.record(key, bean);
    }

    pub(crate) fn add_deleted(&mut self, key: Key, bean: BeanRef) {
        self.deleted.push(bean.clone());
        self.events.push((MapEventKind::Delete, key.clone(), bean.clone()));
        self.record(key, bean);
    }

    pub(crate) fn beans(&self) -> Vec<BeanRef> {
        self.order
            .iter()
            .filter_map(|key| self.beans.get(key).cloned())
            .collect()
    }

    pub(crate) fn is_unchanged(&self) -> bool {
        self.events.is_empty()
    }
}

/// Turns rows into cached beans in two passes. The first pass allocates
/// beans, assigns plain properties and caches them, saving the raw values of
/// columns that derived properties read; the source is closed after it. The
/// second pass assigns derived properties, once every bean of the batch
/// exists, so beans may refer to each other.
pub(crate) struct TabularTransformer {
    factory: Arc<BeanFactory>,
    registry: Arc<BeanFactoryRegistry>,
    schema: Arc<Schema>,
    results: KeysBeansAndEvents,
    /// Rows that belong to another type, or lack the columns to build a bean,
    /// resolved through that type's factory once the source is closed
    find_later: Vec<(TypeName, Key)>,
    cached_columns: HashMap<BeanId, CachedColumns>,
    present_columns: Vec<Column>,
    derived_columns: Vec<Column>,
}

impl TabularTransformer {
    pub(crate) fn new(factory: Arc<BeanFactory>) -> Result<Self> {
        let registry = factory.registry()?;
        let schema = factory.schema().clone();
        let derived_columns = schema.derived_property_columns();
        Ok(Self {
            factory,
            registry,
            schema,
            results: KeysBeansAndEvents::default(),
            find_later: Vec::new(),
            cached_columns: HashMap::new(),
            present_columns: Vec::new(),
            derived_columns,
        })
    }

    fn log_prefix(&self) -> &str {
        self.factory.log_prefix()
    }

    /// Primary key columns the data does not carry
    pub(crate) fn missing_key_columns(schema: &Schema, columns: &[Column]) -> Result<Vec<Column>> {
        Ok(schema
            .primary_key()?
            .iter()
            .filter(|c| !columns.contains(c))
            .cloned()
            .collect())
    }

    /// Read every row. Must run under the factory's hierarchy lock.
    pub(crate) fn first_pass(&mut self, data: &mut dyn TabularData) -> Result<()> {
        let columns = data.columns();
        let missing = Self::missing_key_columns(&self.schema, &columns)?;
        if !missing.is_empty() {
            let missing = missing.iter().map(Column::name).collect::<Vec<_>>().join(", ");
            info!(
                "{}{} does not contain key columns: {}",
                self.log_prefix(),
                data.describe(),
                missing
            );
            return Err(CacheError::MissingKeyColumns {
                type_name: self.schema.type_name.clone(),
                columns: missing,
            });
        }

        let primary_key = self.schema.primary_key()?.to_vec();
        let has_all_key_columns = self
            .schema
            .union_of_key_columns()
            .iter()
            .all(|c| columns.contains(c));
        self.present_columns = columns;

        let mut count = 0usize;
        while let Some(row) = data.next_row()? {
            count += 1;
            if count % 50 == 0 {
                debug!("{}processed {} rows", self.log_prefix(), count);
            }
            let Some(key) = key_from_row(&self.schema, &row, &primary_key) else {
                debug!("{}skipping row with a null key", self.log_prefix());
                continue;
            };
            match row.kind() {
                RowKind::Select => self.select_row(key, &row)?,
                RowKind::Insert | RowKind::Update => {
                    self.change_row(key, &row, has_all_key_columns)?
                }
                RowKind::Delete => self.delete_row(key)?,
            }
        }
        debug!(
            "{}read {} rows from {}",
            self.log_prefix(),
            count,
            data.describe()
        );
        Ok(())
    }

    fn cached_bean(&self, key: &Key) -> Option<BeanRef> {
        self.factory
            .primary_store()
            .get(key)
            .and_then(|cached| cached.as_bean().cloned())
    }

    fn select_row(&mut self, key: Key, row: &Row) -> Result<()> {
        if self.results.contains_key(&key) {
            return Ok(());
        }
        if let Some(bean) = self.cached_bean(&key) {
            self.registry.add_strong_reference(&Cached::Bean(bean.clone()));
            self.results.add_found(key, bean);
            return Ok(());
        }
        if self.schema.has_sub_classes() {
            let sub_class = self.schema.sub_class_for_row(row);
            if sub_class != self.schema.type_name {
                self.find_later.push((sub_class, key));
                return Ok(());
            }
        }
        self.create_bean(key, row, false)
    }

    fn change_row(&mut self, key: Key, row: &Row, has_all_key_columns: bool) -> Result<()> {
        match self.cached_bean(&key) {
            None => {
                if row.kind() == RowKind::Update && !has_all_key_columns {
                    // Not enough to build a bean from; load it whole
                    let type_name = self
                        .schema
                        .ancestor_type()
                        .unwrap_or(&self.schema.type_name)
                        .to_string();
                    self.find_later.push((type_name, key));
                    return Ok(());
                }
                if (self.schema.super_type().is_some() || self.schema.has_sub_classes())
                    && self.schema.sub_class_for_row(row) != self.schema.type_name
                {
                    return Ok(());
                }
                self.create_bean(key, row, true)
            }
            Some(bean) => {
                if bean.type_name() != self.schema.type_name {
                    return Ok(());
                }
                // Rows may split a bean over several statements
                self.assign_default_properties(&bean, row);
                self.cache_derived_columns(&bean, row);
                self.registry.add_strong_reference(&Cached::Bean(bean.clone()));
                self.results.add_updated(key, bean);
                Ok(())
            }
        }
    }

    fn delete_row(&mut self, key: Key) -> Result<()> {
        let Some(bean) = self.cached_bean(&key) else {
            return Ok(());
        };
        if bean.type_name() != self.schema.type_name {
            return Ok(());
        }
        self.factory.remove_with(&key, false, false)?;
        self.cached_columns.remove(&bean.id());
        self.results.add_deleted(key, bean);
        Ok(())
    }

    fn create_bean(&mut self, key: Key, row: &Row, insert: bool) -> Result<()> {
        let bean = match self.factory.discarded_bean(&key) {
            Some(bean) if bean.type_name() == self.schema.type_name => {
                self.factory.forget_discarded(&key);
                self.results.add_reused(&bean);
                bean
            }
            _ => Bean::new(self.schema.type_name.clone()),
        };
        self.assign_default_properties(&bean, row);
        self.cache_derived_columns(&bean, row);
        self.registry.inflation().add(&bean);
        self.results.add_created(key.clone(), bean.clone(), insert);
        self.factory.put_through_hierarchy(&key, &bean, Some(row))
    }

    fn assign_default_properties(&self, bean: &BeanRef, row: &Row) {
        for property in &self.schema.properties {
            let Property::Default(property) = property else {
                continue;
            };
            if row.has_column(&property.column) {
                let value = row.value_as(&property.column, property.data_type);
                self.registry
                    .schemas()
                    .set_property(bean, &property.name, value);
            }
        }
    }

    fn cache_derived_columns(&mut self, bean: &BeanRef, row: &Row) {
        if self.derived_columns.is_empty() {
            return;
        }
        let cached = self.cached_columns.entry(bean.id()).or_default();
        for column in &self.derived_columns {
            if let Some(value) = row.value(column) {
                cached.insert(column.clone(), value.clone());
            }
        }
    }

    /// Resolve deferred rows through the ordinary read path. Runs after the
    /// source is closed and outside the hierarchy lock.
    pub(crate) fn resolve_find_later(&mut self) {
        for (type_name, key) in std::mem::take(&mut self.find_later) {
            let found = self
                .registry
                .get_instance(&type_name, Some(self.factory.data_source()))
                .and_then(|factory| factory.get(&key, None));
            match found {
                Ok(Cached::Bean(bean)) => {
                    self.registry.add_strong_reference(&Cached::Bean(bean.clone()));
                    self.results.add_found(key, bean);
                }
                Ok(_) => debug!(
                    "{}nothing found later for {} {}",
                    self.log_prefix(),
                    type_name,
                    key
                ),
                Err(e) => error!(
                    "{}error finding {} {}: {:#}",
                    self.log_prefix(),
                    type_name,
                    key,
                    e
                ),
            }
        }
    }

    /// Assign derived properties. Created beans get all of them; updated
    /// beans only those reading a column this batch carried.
    pub(crate) fn second_pass(&mut self) {
        if self.results.created.is_empty() && self.results.updated.is_empty() {
            return;
        }
        let schema = self.schema.clone();
        let registry = self.registry.clone();
        for property in schema.derived_properties() {
            let columns = property.columns();
            let touches_batch = columns.iter().any(|c| self.present_columns.contains(c));
            let mut targets: Vec<BeanRef> = self.results.created.clone();
            if touches_batch {
                targets.extend(self.results.updated.iter().cloned());
            }
            if targets.is_empty() {
                continue;
            }

            let Some(mut run) = PropertyRun::new(&registry, &self.factory, property) else {
                continue;
            };
            for bean in &targets {
                run.apply(bean, self.cached_columns.get(&bean.id()));
            }
        }
    }

    /// Queue the batch's change events through the factory hierarchy
    pub(crate) fn queue_change_events(&self, queue: &mut EventQueue) -> Result<()> {
        for (kind, key, bean) in &self.results.events {
            self.factory.fire_map_changed_through_hierarchy(
                Some(&mut *queue),
                *kind,
                Some(key.clone()),
                Some(Cached::Bean(bean.clone())),
            )?;
        }
        Ok(())
    }

    pub(crate) fn queue_commit(&self, queue: &mut EventQueue) -> Result<()> {
        if self.results.is_unchanged() {
            return Ok(());
        }
        self.factory.fire_commit(Some(queue))
    }

    /// Remove this batch's inflation marks, then wait for beans it merely
    /// found that another thread is still inflating
    pub(crate) fn release(&self) {
        let inflation = self.registry.inflation();
        inflation.remove_all(self.results.created.iter());
        inflation.wait_for_all(self.results.found.iter(), self.log_prefix());
    }

    pub(crate) fn fire_lifecycle(&self) {
        let Some(lifecycle) = self.registry.schemas().lifecycle(&self.schema.type_name) else {
            return;
        };
        let report = |callback: &str, bean: &BeanRef, result: anyhow::Result<()>| {
            if let Err(e) = result {
                error!(
                    "{}error in {} callback for {}: {:#}",
                    self.log_prefix(),
                    callback,
                    bean,
                    e
                );
            }
        };
        for bean in &self.results.created {
            if self.results.reused.contains(&bean.id()) {
                report("updated", bean, lifecycle.updated(bean));
            } else {
                report("init", bean, lifecycle.init(bean));
            }
        }
        for bean in &self.results.inserted {
            report("inserted", bean, lifecycle.inserted(bean));
        }
        for bean in &self.results.updated {
            report("updated", bean, lifecycle.updated(bean));
        }
        for bean in &self.results.deleted {
            report("deleted", bean, lifecycle.deleted(bean));
        }
    }

    pub(crate) fn beans(&self) -> Vec<BeanRef> {
        self.results.beans()
    }
}

/// Inflate rows into a factory: first pass under the hierarchy lock, then
/// find-later resolution, second pass, lifecycle callbacks and finally the
/// queued change events. Returns every bean the rows touched.
pub(crate) fn load_tabular_data(
    factory: &BeanFactory,
    data: Box<dyn TabularData>,
) -> Result<Vec<BeanRef>> {
    let mut data = Some(data);
    let result = inflate_rows(factory, || Ok(data.take()), || {});
    // Still here if inflation never got as far as opening it
    if let Some(mut data) = data {
        data.close();
    }
    Ok(result?.unwrap_or_default())
}

/// Like [`load_tabular_data`], but the rows are only opened once the
/// hierarchy lock is held. `open` may decline with `None`, in which case
/// nothing is inflated. `first_pass_done` runs under the same lock once the
/// first pass has succeeded.
pub(crate) fn inflate_rows<O, F>(
    factory: &BeanFactory,
    open: O,
    first_pass_done: F,
) -> Result<Option<Vec<BeanRef>>>
where
    O: FnOnce() -> Result<Option<Box<dyn TabularData>>>,
    F: FnOnce(),
{
    let factory = factory.arc()?;
    let registry = factory.registry()?;
    let mut transformer = TabularTransformer::new(factory.clone())?;
    let frame = registry.enter_load_stack(&factory);

    let first = {
        let _guard = factory.lock();
        match open() {
            Ok(Some(mut data)) => {
                let result = transformer.first_pass(data.as_mut());
                data.close();
                if result.is_ok() {
                    first_pass_done();
                }
                result.map(|_| true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        }
    };
    if let Ok(false) = first {
        return Ok(None);
    }

    let mut queue = EventQueue::new();
    let result = first.and_then(|_| {
        transformer.resolve_find_later();
        transformer.second_pass();
        transformer.queue_change_events(&mut queue)?;
        transformer.queue_commit(&mut queue)
    });
    transformer.release();
    result?;

    transformer.fire_lifecycle();
    drop(frame);
    queue.fire(&registry);
    Ok(Some(transformer.beans()))
}

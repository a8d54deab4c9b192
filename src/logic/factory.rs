use log::{debug, error, warn};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::Cell;
use std::sync::{Arc, Weak};

use crate::error::{CacheError, Result};
use crate::logic::{
    load_tabular_data, BeanFactoryRegistry, BeanLoader, CriteriaBeanCollection, EventQueue,
};
use crate::model::{
    key_from_row, BeanCollection, BeanRef, Cached, Cardinality, CriterionGroup, FactoryKey, Key,
    MapEvent, MapEventKind, MapListener, Parameter, Property, ReferenceType, Row, Schema,
    TabularData, Value,
};
use crate::store::{Association, IndexedAssociation};

/// Cache of the beans of one type from one data source.
///
/// Beans are held in a primary store keyed by primary key and in one store
/// per declared index. Every factory in a type hierarchy shares one lock, so
/// a bean is never visible in a sub-type's stores without also being visible
/// in its super types' stores.
pub struct BeanFactory {
    key: FactoryKey,
    schema: Arc<Schema>,
    registry: Weak<BeanFactoryRegistry>,
    loader: Arc<dyn BeanLoader>,
    lock: Arc<ReentrantMutex<()>>,
    reference_type: ReferenceType,
    primary: Association,
    indices: Vec<IndexedAssociation>,
    /// Beans removed from the cache, reused if their key is loaded again
    discarded: Association,
    listeners: Mutex<Vec<Arc<dyn MapListener>>>,
    all_beans: Mutex<Option<CriteriaBeanCollection>>,
    /// Held across the loader's init hook; the flag says whether it has run
    init_lock: ReentrantMutex<Cell<bool>>,
    log_prefix: String,
    self_ref: Weak<BeanFactory>,
}

impl BeanFactory {
    pub(crate) fn new(
        registry: &Arc<BeanFactoryRegistry>,
        schema: Arc<Schema>,
        data_source: &str,
        loader: Arc<dyn BeanLoader>,
    ) -> Arc<Self> {
        let key = FactoryKey::new(schema.type_name.clone(), data_source);
        let log_prefix = format!("{}: ", key);

        // Small, static types are always held strongly
        let reference_type = if schema.is_low_quantity_and_volatility() {
            ReferenceType::Strong
        } else {
            schema.reference_type
        };
        let capacity = registry.config().soft_reference_capacity;

        let primary = Association::with_reference_type(&schema.type_name, reference_type, capacity);
        {
            let prefix = log_prefix.clone();
            primary.add_removed_listener(Arc::new(move |key: &Key| {
                debug!("{}removing reference for key: {}", prefix, key);
            }));
        }

        let indices = schema
            .indices
            .iter()
            .map(|index| {
                let name = format!("{}.{}", schema.type_name, index.name);
                if !index.unique && !schema.indexable && reference_type == ReferenceType::Strong {
                    warn!(
                        "{}index {} is not indexable, removing a bean scans every collection",
                        log_prefix, index.name
                    );
                }
                let store = Association::with_reference_type(&name, reference_type, capacity);
                IndexedAssociation::new(&schema.type_name, index.clone(), store, schema.indexable)
            })
            .collect();

        let discarded = Association::weak(&format!("{}.discarded", schema.type_name));
        let lock = registry.lock_for(schema.hierarchy_root(), data_source);

        Arc::new_cyclic(|self_ref| BeanFactory {
            key,
            schema,
            registry: Arc::downgrade(registry),
            loader,
            lock,
            reference_type,
            primary,
            indices,
            discarded,
            listeners: Mutex::new(Vec::new()),
            all_beans: Mutex::new(None),
            init_lock: ReentrantMutex::new(Cell::new(false)),
            log_prefix,
            self_ref: self_ref.clone(),
        })
    }

    pub fn key(&self) -> &FactoryKey {
        &self.key
    }

    pub fn type_name(&self) -> &str {
        &self.key.type_name
    }

    pub fn data_source(&self) -> &str {
        &self.key.data_source
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn reference_type(&self) -> ReferenceType {
        self.reference_type
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    pub fn registry(&self) -> Result<Arc<BeanFactoryRegistry>> {
        self.registry.upgrade().ok_or(CacheError::RegistryUnavailable)
    }

    pub(crate) fn arc(&self) -> Result<Arc<BeanFactory>> {
        self.self_ref.upgrade().ok_or(CacheError::RegistryUnavailable)
    }

    pub fn loader(&self) -> &Arc<dyn BeanLoader> {
        &self.loader
    }

    /// Take the lock shared by this factory's hierarchy
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn shares_lock_with(&self, other: &BeanFactory) -> bool {
        Arc::ptr_eq(&self.lock, &other.lock)
    }

    /// Run the loader's init hook once. Callers racing the first call wait
    /// until the hook has finished.
    pub(crate) fn init(&self) -> Result<()> {
        let inited = self.init_lock.lock();
        if inited.get() {
            return Ok(());
        }
        inited.set(true);
        debug!("{}initialising", self.log_prefix);
        self.loader.init(self)
    }

    pub(crate) fn reset_load_stack(&self) {
        self.loader.reset_load_stack();
    }

    pub fn super_factory(&self) -> Result<Option<Arc<BeanFactory>>> {
        match self.schema.super_type() {
            Some(super_type) => Ok(Some(
                self.registry()?
                    .get_instance(super_type, Some(self.data_source()))?,
            )),
            None => Ok(None),
        }
    }

    fn existing_sub_factories(&self) -> Vec<Arc<BeanFactory>> {
        let Some(registry) = self.registry.upgrade() else {
            return Vec::new();
        };
        self.schema
            .sub_classes()
            .iter()
            .filter_map(|sub| registry.existing_instance(sub, self.data_source()))
            .collect()
    }

    /// Whether beans of `type_name` may be cached here: this type or any of
    /// its descendants
    pub fn accepts(&self, type_name: &str) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return type_name == self.type_name();
        };
        let mut current = Some(type_name.to_string());
        while let Some(name) = current {
            if name == self.type_name() {
                return true;
            }
            current = registry
                .schemas()
                .get(&name)
                .ok()
                .and_then(|s| s.super_type.clone());
        }
        false
    }

    pub fn index_store(&self, index: &str) -> Result<&IndexedAssociation> {
        self.indices
            .iter()
            .find(|i| i.index_name() == index)
            .ok_or_else(|| CacheError::MissingIndex {
                type_name: self.type_name().to_string(),
                index: index.to_string(),
            })
    }

    pub fn primary_store(&self) -> &Association {
        &self.primary
    }

    fn store_get(&self, key: &Key, index: Option<&str>) -> Result<Option<Cached>> {
        match index {
            None => Ok(self.primary.get(key)),
            Some(name) => Ok(self.index_store(name)?.get(key)),
        }
    }

    fn coerce_key(&self, key: &Key, index: Option<&str>) -> Result<Key> {
        let columns = self.schema.key_columns(index)?;
        Ok(self.schema.change_key_type(key, &columns))
    }

    /// Value for a key of the primary store, or of a named index. A miss is
    /// loaded; a key that loads nothing is remembered so it is not loaded
    /// again. Beans another thread is still inflating are waited for.
    pub fn get(&self, key: &Key, index: Option<&str>) -> Result<Cached> {
        let key = self.coerce_key(key, index)?;
        let value = match self.store_get(&key, index)? {
            Some(value) => value,
            None => {
                let loaded = self.loader.load(self, &key, index)?;
                if loaded.is_null() {
                    self.put_null_key(&key, index)?
                } else {
                    loaded
                }
            }
        };
        self.wait_for_inflation(&value);
        Ok(value)
    }

    pub fn get_bean(&self, key: &Key) -> Result<Option<BeanRef>> {
        Ok(self.get(key, None)?.as_bean().cloned())
    }

    /// Beans for several keys. Collections are flattened and keys with
    /// nothing behind them are skipped.
    pub fn get_objects(&self, keys: &[Key], index: Option<&str>) -> Result<Vec<BeanRef>> {
        let mut beans = Vec::with_capacity(keys.len());
        for key in keys {
            beans.extend(self.get(key, index)?.beans());
        }
        Ok(beans)
    }

    /// Every bean matching the criteria, loading as needed
    pub fn get_objects_matching(&self, criteria: &CriterionGroup) -> Result<Vec<BeanRef>> {
        let beans = self.loader.get_objects(self, criteria)?;
        self.registry()?
            .inflation()
            .wait_for_all(beans.iter(), &self.log_prefix);
        Ok(beans)
    }

    /// Live collection of the beans matching the criteria
    pub fn get_bean_collection(&self, criteria: CriterionGroup) -> Result<CriteriaBeanCollection> {
        CriteriaBeanCollection::new(&self.arc()?, criteria)
    }

    /// Live collection of every bean, created on first use
    pub fn get_all_bean_collection(&self) -> Result<CriteriaBeanCollection> {
        let mut all_beans = self.all_beans.lock();
        if let Some(existing) = all_beans.as_ref() {
            return Ok(existing.clone());
        }
        let collection = CriteriaBeanCollection::new(&self.arc()?, CriterionGroup::all())?;
        *all_beans = Some(collection.clone());
        Ok(collection)
    }

    fn wait_for_inflation(&self, value: &Cached) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .inflation()
                .wait_for_all(value.beans().iter(), &self.log_prefix);
        }
    }

    /// Record that nothing exists for a key. If another thread cached a value
    /// in the meantime, that value is returned instead.
    fn put_null_key(&self, key: &Key, index: Option<&str>) -> Result<Cached> {
        let _guard = self.lock();
        if let Some(existing) = self.store_get(key, index)? {
            return Ok(existing);
        }
        match index {
            None => {
                self.primary.put(key.clone(), Cached::Null);
                Ok(Cached::Null)
            }
            Some(name) => {
                let store = self.index_store(name)?;
                if store.is_unique() {
                    store.put(key.clone(), Cached::Null)?;
                    return Ok(Cached::Null);
                }
                let collection = BeanCollection::new(self.type_name());
                let value = Cached::Collection(collection);
                store.put(key.clone(), value.clone())?;
                self.registry()?.add_strong_reference(&value);
                Ok(value)
            }
        }
    }

    /// Value to hand back from a load: whatever the load left in the store,
    /// or for an index whose entry is missing, the loaded beans under that
    /// index key
    pub(crate) fn loaded_value(
        &self,
        key: &Key,
        index: Option<&str>,
        beans: &[BeanRef],
    ) -> Result<Cached> {
        let _guard = self.lock();
        if let Some(value) = self.store_get(key, index)? {
            return Ok(value);
        }
        let Some(name) = index else {
            return Ok(Cached::Null);
        };

        let matching: Vec<BeanRef> = beans
            .iter()
            .filter(|bean| self.accepts(bean.type_name()))
            .filter(|bean| self.loader.create_key(self, bean, index).as_ref() == Some(key))
            .cloned()
            .collect();
        if matching.is_empty() {
            return Ok(Cached::Null);
        }

        let store = self.index_store(name)?;
        let value = if store.is_unique() {
            Cached::Bean(matching[0].clone())
        } else {
            let collection = BeanCollection::new(self.type_name());
            for bean in matching {
                collection.add(bean);
            }
            Cached::Collection(collection)
        };
        store.put(key.clone(), value.clone())?;
        self.registry()?.add_strong_reference(&value);
        Ok(value)
    }

    /// Whether a key is cached and none of its beans are mid-inflation
    pub fn is_fully_inflated_key(&self, key: &Key, index: Option<&str>) -> bool {
        let Ok(Some(value)) = self.store_get(key, index) else {
            return false;
        };
        let Some(registry) = self.registry.upgrade() else {
            return true;
        };
        value
            .beans()
            .iter()
            .all(|bean| !registry.inflation().is_partially_inflated(bean.id()))
    }

    pub fn contains_key(&self, key: &Key, index: Option<&str>) -> bool {
        let Ok(key) = self.coerce_key(key, index) else {
            return false;
        };
        matches!(self.store_get(&key, index), Ok(Some(_)))
    }

    pub fn keys(&self) -> Vec<Key> {
        self.primary.keys()
    }

    pub fn values(&self) -> Vec<Cached> {
        self.primary.values()
    }

    pub fn entries(&self) -> Vec<(Key, Cached)> {
        self.primary.entries()
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// Key a value is stored under, falling back to deriving it from the
    /// bean's properties
    pub fn key_for_value(&self, value: &Cached, index: Option<&str>) -> Result<Option<Key>> {
        let found = match index {
            None => self.primary.key_for_value(value),
            Some(name) => self.index_store(name)?.store().key_for_value(value),
        };
        if found.is_some() {
            return Ok(found);
        }
        Ok(value
            .as_bean()
            .and_then(|bean| self.loader.create_key(self, bean, index)))
    }

    /// Build a key from a bean's properties. Columns bound to a plain
    /// property read it; columns feeding a to-one foreign key take the
    /// matching component of the related bean's key.
    pub fn key_from_properties(
        &self,
        bean: &crate::model::Bean,
        index: Option<&str>,
    ) -> Option<Key> {
        let columns = self.schema.key_columns(index).ok()?;
        let registry = self.registry.upgrade()?;
        let mut values = Vec::with_capacity(columns.len());
        for column in &columns {
            let value = match self.schema.default_property_for_column(column) {
                Some(property) => registry.schemas().get_property(bean, &property.name),
                None => self.key_component_from_foreign_key(&registry, bean, column)?,
            };
            values.push(value);
        }
        let key = Key::from_values(&values)?;
        Some(self.schema.change_key_type(&key, &columns))
    }

    fn key_component_from_foreign_key(
        &self,
        registry: &BeanFactoryRegistry,
        bean: &crate::model::Bean,
        column: &crate::model::Column,
    ) -> Option<Value> {
        self.schema.properties.iter().find_map(|property| {
            let Property::ForeignKey(fk) = property else {
                return None;
            };
            if fk.cardinality != Cardinality::One {
                return None;
            }
            let position = fk.parameters.iter().position(|p| {
                matches!(p, Parameter::Column { column: c, .. } if c == column)
            })?;
            let related = registry.schemas().get_property(bean, &fk.name);
            let related = related.as_bean()?;
            let key = registry
                .key_for_bean(related, fk.foreign_index.as_deref())
                .ok()
                .flatten()?;
            key.component(position).map(|c| c.to_value())
        })
    }

    /// Cache a value under a key, firing INSERT and COMMIT
    pub fn put(&self, key: Key, value: Cached) -> Result<()> {
        self.put_with(key, value, true, true)
    }

    /// Cache a value under a key unless a value of the same nullness is
    /// already cached there. The value is also put into every super type's
    /// factory.
    pub fn put_with(
        &self,
        key: Key,
        value: Cached,
        fire_commit: bool,
        fire_map_changed: bool) -> Result<()> {
        let key = self.coerce_key(&key, None)?;
        let can_put = {
            let _guard = self.lock();
            let existing = self.primary.get(&key);
            let can_put = match &existing {
                None => true,
                Some(existing) => existing.is_null() != value.is_null(),
            };
            if can_put {
                if let Some(previous) = existing.filter(|_| value.is_null()) {
                    self.remove_from_indexed_stores(&previous);
                }
                self.put_in_primary_store(&key, &value)?;
                if let Some(bean) = value.as_bean() {
                    self.put_into_indexed_stores(bean, None)?;
                }
            }
            can_put
        };
        if !can_put {
            debug!("{}not replacing cached value for key: {}", self.log_prefix, key);
            return Ok(());
        }

        if let Some(super_factory) = self.super_factory()? {
            super_factory.put_with(key.clone(), value.clone(), fire_commit, fire_map_changed)?;
        }
        if fire_map_changed {
            self.fire_map_changed(MapEvent::new(
                self.key.clone(),
                MapEventKind::Insert,
                Some(key),
                Some(value),
            ));
        }
        if fire_commit {
            self.fire_map_changed(MapEvent::commit(self.key.clone()));
        }
        Ok(())
    }

    /// Cache several entries, then fire a single ALL_ROWS and COMMIT through
    /// the hierarchy
    pub fn put_all(&self, entries: Vec<(Key, Cached)>) -> Result<()> {
        for (key, value) in entries {
            self.put_with(key, value, false, false)?;
        }
        self.fire_map_changed_through_hierarchy(None, MapEventKind::AllRows, None, None)?;
        self.fire_commit(None)
    }

    /// Cache a bean under the key derived from its properties
    pub fn put_value(&self, bean: BeanRef) -> Result<()> {
        let key = self.key_for_new_value(&bean)?;
        self.put(key, Cached::Bean(bean))
    }

    fn key_for_new_value(&self, bean: &BeanRef) -> Result<Key> {
        self.loader
            .create_key(self, bean, None)
            .ok_or_else(|| CacheError::MissingKeyColumns {
                type_name: self.type_name().to_string(),
                columns: self
                    .schema
                    .primary_key
                    .iter()
                    .map(|c| c.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    pub(crate) fn put_in_primary_store(&self, key: &Key, value: &Cached) -> Result<()> {
        if let Some(bean) = value.as_bean() {
            if !self.accepts(bean.type_name()) {
                return Err(CacheError::FactoryTypeMismatch {
                    factory_type: self.type_name().to_string(),
                    value_type: bean.type_name().to_string(),
                    key: key.to_string(),
                });
            }
        }
        self.primary.put(key.clone(), value.clone());

        let registry = self.registry()?;
        registry.add_strong_reference(value);
        if let Some(bean) = value.as_bean() {
            registry.register_bean(bean, &self.key);
        }
        Ok(())
    }

    /// Add a bean to every index it has a key for. With a row, index keys
    /// come from the row's columns where it carries them.
    pub(crate) fn put_into_indexed_stores(&self, bean: &BeanRef, row: Option<&Row>) -> Result<()> {
        if self.indices.is_empty() {
            return Ok(());
        }
        let registry = self.registry()?;
        for index in &self.indices {
            let from_row = row
                .filter(|row| row.has_columns(&index.index().columns))
                .and_then(|row| key_from_row(&self.schema, row, &index.index().columns));
            let key = from_row
                .or_else(|| self.loader.create_key(self, bean, Some(index.index_name())));
            let Some(key) = key else {
                continue;
            };
            if let Some(created) = index.put(key, Cached::Bean(bean.clone()))? {
                registry.add_strong_reference(&Cached::Collection(created));
            }
        }
        Ok(())
    }

    fn remove_from_indexed_stores(&self, value: &Cached) {
        for index in &self.indices {
            index.remove_value(value);
        }
    }

    /// Put a freshly created bean into this factory and every super type's,
    /// without firing events
    pub(crate) fn put_through_hierarchy(
        &self,
        key: &Key,
        bean: &BeanRef,
        row: Option<&Row>) -> Result<()> {
        let _guard = self.lock();
        let value = Cached::Bean(bean.clone());
        self.put_in_primary_store(key, &value)?;
        self.put_into_indexed_stores(bean, row)?;
        if let Some(super_factory) = self.super_factory()? {
            super_factory.put_through_hierarchy(key, bean, row)?;
        }
        Ok(())
    }

    pub fn remove(&self, key: &Key) -> Result<Option<Cached>> {
        self.remove_with(key, true, true)
    }

    /// Remove a key from this factory and every super type's. Removed beans
    /// are kept aside for reuse.
    pub fn remove_with(
        &self,
        key: &Key,
        fire_commit: bool,
        fire_map_changed: bool,
    ) -> Result<Option<Cached>> {
        let key = self.coerce_key(key, None)?;
        let removed = {
            let _guard = self.lock();
            let removed = self.primary.remove(&key);
            if let Some(value) = &removed {
                if value.as_bean().is_some() {
                    self.discarded.put(key.clone(), value.clone());
                }
                self.remove_from_indexed_stores(value);
            }
            removed
        };
        let Some(value) = removed else {
            return Ok(None);
        };

        if let Some(super_factory) = self.super_factory()? {
            super_factory.remove_with(&key, fire_commit, fire_map_changed)?;
        }
        if fire_map_changed {
            self.fire_map_changed(MapEvent::new(
                self.key.clone(),
                MapEventKind::Delete,
                Some(key),
                Some(value.clone()),
            ));
        }
        if fire_commit {
            self.fire_map_changed(MapEvent::commit(self.key.clone()));
        }
        Ok(Some(value))
    }

    pub fn remove_value(&self, bean: &BeanRef) -> Result<Option<Cached>> {
        match self.key_for_value(&Cached::Bean(bean.clone()), None)? {
            Some(key) => self.remove(&key),
            None => Ok(None),
        }
    }

    /// Tell listeners a cached bean changed in place. Index entries are
    /// refreshed in case key properties changed.
    pub fn update_value(&self, bean: &BeanRef) -> Result<()> {
        let value = Cached::Bean(bean.clone());
        let Some(key) = self.key_for_value(&value, None)? else {
            return Ok(());
        };
        self.reindex_through_hierarchy(bean)?;
        self.fire_map_changed_through_hierarchy(
            None,
            MapEventKind::Update,
            Some(key),
            Some(value),
        )?;
        self.fire_commit(None)
    }

    fn reindex_through_hierarchy(&self, bean: &BeanRef) -> Result<()> {
        {
            let _guard = self.lock();
            self.remove_from_indexed_stores(&Cached::Bean(bean.clone()));
            self.put_into_indexed_stores(bean, None)?;
        }
        if let Some(super_factory) = self.super_factory()? {
            super_factory.reindex_through_hierarchy(bean)?;
        }
        Ok(())
    }

    pub(crate) fn discarded_bean(&self, key: &Key) -> Option<BeanRef> {
        self.discarded.get(key).and_then(|v| v.as_bean().cloned())
    }

    pub(crate) fn forget_discarded(&self, key: &Key) {
        self.discarded.remove(key);
    }

    pub fn clear(&self) -> Result<()> {
        self.clear_with(None, true, true)
    }

    /// Drop every cached entry of this factory. Its entries leave the super
    /// types' stores too, and every existing sub-type factory is emptied.
    pub fn clear_with(
        &self,
        queue: Option<&mut EventQueue>,
        fire_commit: bool,
        fire_map_changed: bool) -> Result<()> {
        let super_factory = self.super_factory()?;
        let (cleared, children) = {
            let _guard = self.lock();
            let entries = self.primary.entries();
            if let Some(super_factory) = &super_factory {
                super_factory.clear_super_bean_factory(&entries);
            }
            self.clear_own_entries(&entries);
            let mut children = Vec::new();
            self.clear_child_bean_factories(&mut children);
            (entries.len(), children)
        };
        debug!("{}cleared {} entries", self.log_prefix, cleared);

        let mut affected: Vec<FactoryKey> = Vec::new();
        let mut ancestor = super_factory;
        while let Some(factory) = ancestor {
            affected.push(factory.key().clone());
            ancestor = factory.super_factory()?;
        }
        affected.push(self.key.clone());
        affected.extend(children.iter().map(|c| c.key().clone()));

        let mut local = EventQueue::new();
        let queue = match queue {
            Some(queue) => queue,
            None => &mut local,
        };
        for source in affected {
            if fire_map_changed {
                queue.push(MapEvent::all_rows(source.clone()));
            }
            if fire_commit {
                queue.push(MapEvent::commit(source));
            }
        }
        if !local.is_empty() {
            local.fire(&*self.registry()?);
        }
        Ok(())
    }

    fn clear_own_entries(&self, entries: &[(Key, Cached)]) {
        for (key, value) in entries {
            if value.as_bean().is_some() {
                self.discarded.put(key.clone(), value.clone());
            }
        }
        self.primary.clear();
        self.loader.clear_impl(self);
        for index in &self.indices {
            index.clear();
        }
    }

    fn clear_super_bean_factory(&self, entries: &[(Key, Cached)]) {
        let _guard = self.lock();
        for (key, value) in entries {
            if self.primary.get(key).is_some_and(|v| v.same(value)) {
                self.primary.remove(key);
            }
            self.remove_from_indexed_stores(value);
        }
        if let Ok(Some(super_factory)) = self.super_factory() {
            super_factory.clear_super_bean_factory(entries);
        }
    }

    fn clear_child_bean_factories(&self, children: &mut Vec<Arc<BeanFactory>>) {
        for child in self.existing_sub_factories() {
            let entries = child.primary.entries();
            child.clear_own_entries(&entries);
            child.clear_child_bean_factories(children);
            children.push(child);
        }
    }

    pub fn add_map_listener(&self, listener: Arc<dyn MapListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_map_listener(&self, listener: &Arc<dyn MapListener>) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Deliver an event to this factory's listeners. Listeners that are no
    /// longer alive are dropped; listener errors are logged.
    pub fn fire_map_changed(&self, event: MapEvent) {
        let listeners = self.listeners.lock().clone();
        let mut dead = false;
        for listener in &listeners {
            if !listener.is_alive() {
                dead = true;
                continue;
            }
            if let Err(e) = listener.map_changed(&event) {
                error!(
                    "{}error in map listener handling {:?}: {:#}",
                    self.log_prefix, event.kind, e
                );
            }
        }
        if dead {
            self.listeners.lock().retain(|l| l.is_alive());
        }
        for index in &self.indices {
            index.commit_collections();
        }
    }

    /// Raise an event from this factory and every super type's, super types
    /// first. Queued if a queue is given, otherwise fired now.
    pub fn fire_map_changed_through_hierarchy(
        &self,
        mut queue: Option<&mut EventQueue>,
        kind: MapEventKind,
        key: Option<Key>,
        value: Option<Cached>,
    ) -> Result<()> {
        if let Some(super_factory) = self.super_factory()? {
            super_factory.fire_map_changed_through_hierarchy(
                queue.as_deref_mut(),
                kind,
                key.clone(),
                value.clone(),
            )?;
        }
        let event = MapEvent::new(self.key.clone(), kind, key, value);
        match queue {
            Some(queue) => queue.push(event),
            None => self.fire_map_changed(event),
        }
        Ok(())
    }

    pub fn fire_commit(&self, queue: Option<&mut EventQueue>) -> Result<()> {
        self.fire_map_changed_through_hierarchy(queue, MapEventKind::Commit, None, None)
    }

    /// Drop entries whose beans have been reclaimed. Returns how many went.
    pub fn sweep(&self) -> usize {
        let mut swept = self.primary.sweep();
        for index in &self.indices {
            swept += index.store().sweep();
        }
        swept + self.discarded.sweep()
    }

    /// Inflate rows into beans and cache them
    pub fn inflate(&self, data: Box<dyn TabularData>) -> Result<Vec<BeanRef>> {
        load_tabular_data(self, data)
    }
}

impl std::fmt::Debug for BeanFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeanFactory")
            .field("key", &self.key)
            .field("reference_type", &self.reference_type)
            .field("entries", &self.primary.len())
            .finish()
    }
}

use log::{debug, error, info};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::logic::{BeanFactory, BeanFactoryType, DefaultBeanFactoryType, PartialInflation};
use crate::model::{
    Bean, BeanId, BeanRef, Cached, DataLevel, FactoryKey, Key, MapEvent, Schema, SchemaRegistry,
    TypeName,
};

#[derive(Debug, Default)]
struct LoadStack {
    depth: usize,
    /// Factories that loaded since the stack was last empty
    factories: Vec<FactoryKey>,
}

/// Process-wide home of every bean factory and of the state shared between
/// them: hierarchy locks, bean ownership, partial inflation marks, strong
/// references held for the duration of a load, and the load stack.
pub struct BeanFactoryRegistry {
    schemas: Arc<SchemaRegistry>,
    config: CacheConfig,
    factory_types: RwLock<HashMap<String, Arc<dyn BeanFactoryType>>>,
    instances: RwLock<HashMap<FactoryKey, Arc<BeanFactory>>>,
    /// Factories of one kind and data source, in schema declaration order.
    /// Also serializes their creation.
    instances_by_factory_type: Mutex<HashMap<(String, String), Vec<Arc<BeanFactory>>>>,
    inited_types: Mutex<Vec<String>>,
    post_inited_types: Mutex<HashSet<String>>,
    post_inited: AtomicBool,
    /// One lock per hierarchy root and data source
    locks: Mutex<HashMap<FactoryKey, Arc<ReentrantMutex<()>>>>,
    /// Which factory produced each bean
    bean_info: Mutex<HashMap<BeanId, (Weak<Bean>, FactoryKey)>>,
    strong_references: Mutex<HashMap<Uuid, Cached>>,
    load_stack: Mutex<LoadStack>,
    inflation: PartialInflation,
    self_ref: Weak<BeanFactoryRegistry>,
}

pub struct BeanFactoryRegistryBuilder {
    schemas: SchemaRegistry,
    config: CacheConfig,
    factory_types: Vec<Arc<dyn BeanFactoryType>>,
    post_inited: bool,
}

impl BeanFactoryRegistryBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn factory_type(mut self, factory_type: Arc<dyn BeanFactoryType>) -> Self {
        self.factory_types.push(factory_type);
        self
    }

    /// Whether post-init hooks run as soon as a kind is initialised. When
    /// false they wait for `post_init_all_bean_factory_types`.
    pub fn post_inited(mut self, post_inited: bool) -> Self {
        self.post_inited = post_inited;
        self
    }

    pub fn build(self) -> Arc<BeanFactoryRegistry> {
        let mut factory_types: HashMap<String, Arc<dyn BeanFactoryType>> = HashMap::new();
        factory_types.insert(
            DefaultBeanFactoryType.name().to_string(),
            Arc::new(DefaultBeanFactoryType),
        );
        for factory_type in self.factory_types {
            factory_types.insert(factory_type.name().to_string(), factory_type);
        }

        let timeout = self.config.inflation_wait_timeout();
        Arc::new_cyclic(|self_ref| BeanFactoryRegistry {
            schemas: Arc::new(self.schemas),
            config: self.config,
            factory_types: RwLock::new(factory_types),
            instances: RwLock::new(HashMap::new()),
            instances_by_factory_type: Mutex::new(HashMap::new()),
            inited_types: Mutex::new(Vec::new()),
            post_inited_types: Mutex::new(HashSet::new()),
            post_inited: AtomicBool::new(self.post_inited),
            locks: Mutex::new(HashMap::new()),
            bean_info: Mutex::new(HashMap::new()),
            strong_references: Mutex::new(HashMap::new()),
            load_stack: Mutex::new(LoadStack::default()),
            inflation: PartialInflation::new(timeout),
            self_ref: self_ref.clone(),
        })
    }
}

impl BeanFactoryRegistry {
    pub fn builder(schemas: SchemaRegistry) -> BeanFactoryRegistryBuilder {
        BeanFactoryRegistryBuilder {
            schemas,
            config: CacheConfig::default(),
            factory_types: Vec::new(),
            post_inited: true,
        }
    }

    pub fn new(schemas: SchemaRegistry, config: CacheConfig) -> Arc<Self> {
        Self::builder(schemas).config(config).build()
    }

    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn inflation(&self) -> &PartialInflation {
        &self.inflation
    }

    pub fn register_factory_type(&self, factory_type: Arc<dyn BeanFactoryType>) {
        self.factory_types
            .write()
            .insert(factory_type.name().to_string(), factory_type);
    }

    pub fn factory_type(&self, name: &str) -> Result<Arc<dyn BeanFactoryType>> {
        self.factory_types
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownFactoryType(name.to_string()))
    }

    /// Data source used when the caller does not name one
    pub fn data_source_for(&self, schema: &Schema, data_source: Option<&str>) -> String {
        data_source
            .map(str::to_string)
            .or_else(|| schema.default_data_source.clone())
            .unwrap_or_else(|| self.config.default_data_source.clone())
    }

    /// Factory caching `type_name` beans from a data source. The first request
    /// for a kind of factory and data source creates every factory of that
    /// kind at once.
    pub fn get_instance(
        &self,
        type_name: &str,
        data_source: Option<&str>,
    ) -> Result<Arc<BeanFactory>> {
        let schema = self.schemas.get(type_name)?;
        let data_source = self.data_source_for(&schema, data_source);
        let key = FactoryKey::new(schema.type_name.clone(), data_source.clone());

        // Factories created alongside another type still need their own init
        let existing = self.instances.read().get(&key).cloned();
        if let Some(factory) = existing {
            factory.init()?;
            return Ok(factory);
        }

        self.create_instances(&schema.bean_factory_type, &data_source)?;
        let factory = self
            .instances
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| CacheError::MissingSchema(type_name.to_string()))?;
        factory.init()?;
        Ok(factory)
    }

    /// Factory for a type if it has already been created
    pub fn existing_instance(
        &self,
        type_name: &str,
        data_source: &str,
    ) -> Option<Arc<BeanFactory>> {
        let type_name = self.schemas.resolve_type_name(type_name).ok()?;
        self.instances
            .read()
            .get(&FactoryKey::new(type_name, data_source))
            .cloned()
    }

    /// Every factory created so far
    pub fn instances(&self) -> Vec<Arc<BeanFactory>> {
        self.instances.read().values().cloned().collect()
    }

    /// Types with a factory for a data source
    pub fn bean_factory_types(&self, data_source: &str) -> Vec<TypeName> {
        let mut types: Vec<TypeName> = self
            .instances
            .read()
            .keys()
            .filter(|k| k.data_source == data_source)
            .map(|k| k.type_name.clone())
            .collect();
        types.sort();
        types
    }

    fn create_instances(&self, bean_factory_type: &str, data_source: &str) -> Result<()> {
        let factory_type = self.factory_type(bean_factory_type)?;
        let registry = self.self_ref.upgrade().ok_or(CacheError::RegistryUnavailable)?;

        let created = {
            let mut by_type = self.instances_by_factory_type.lock();
            let group_key = (bean_factory_type.to_string(), data_source.to_string());
            if by_type.contains_key(&group_key) {
                false
            } else {
                debug!(
                    "Adding bean factories for: {} and data source: '{}'",
                    bean_factory_type, data_source
                );
                let mut group = Vec::new();
                for schema in self.schemas.schemas_for_factory_type(bean_factory_type) {
                    let loader = factory_type.create_loader(&schema, data_source)?;
                    group.push(BeanFactory::new(&registry, schema, data_source, loader));
                }
                {
                    let mut instances = self.instances.write();
                    for factory in &group {
                        instances.insert(factory.key().clone(), factory.clone());
                    }
                }
                by_type.insert(group_key, group);
                true
            }
        };

        if created {
            self.init_bean_factory_type(&factory_type);
        }
        Ok(())
    }

    fn init_bean_factory_type(&self, factory_type: &Arc<dyn BeanFactoryType>) {
        let name = factory_type.name().to_string();
        {
            let mut inited = self.inited_types.lock();
            if inited.contains(&name) {
                return;
            }
            inited.push(name.clone());
        }

        match factory_type.init_bean_factory_type(self) {
            None => info!("Not initialising: {} as no init hook is provided", name),
            Some(Ok(())) => info!("Initialised: {}", name),
            Some(Err(e)) => error!("Error initialising: {}: {:#}", name, e),
        }

        if self.post_inited.load(Ordering::SeqCst) {
            self.post_init_bean_factory_type(factory_type);
        }
    }

    fn post_init_bean_factory_type(&self, factory_type: &Arc<dyn BeanFactoryType>) {
        let name = factory_type.name().to_string();
        if !self.post_inited_types.lock().insert(name.clone()) {
            return;
        }

        match factory_type.post_init_bean_factory_type(self) {
            None => info!("Not post initialising: {} as no post-init hook is provided", name),
            Some(Ok(())) => info!("Post initialised: {}", name),
            Some(Err(e)) => error!("Error post initialising: {}: {:#}", name, e),
        }
    }

    pub fn set_post_inited(&self, post_inited: bool) {
        self.post_inited.store(post_inited, Ordering::SeqCst);
    }

    /// Enter the post-init phase and run the post-init hook of every kind
    /// initialised so far
    pub fn post_init_all_bean_factory_types(&self) {
        let inited = {
            let inited = self.inited_types.lock();
            self.post_inited.store(true, Ordering::SeqCst);
            inited.clone()
        };
        for name in inited {
            if let Ok(factory_type) = self.factory_type(&name) {
                self.post_init_bean_factory_type(&factory_type);
            }
        }
    }

    pub(crate) fn lock_for(
        &self,
        hierarchy_root: &str,
        data_source: &str) -> Arc<ReentrantMutex<()>> {
        self.locks
            .lock()
            .entry(FactoryKey::new(hierarchy_root, data_source))
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
            .clone()
    }

    /// Record which factory produced a bean. The first factory to register a
    /// bean owns it; returns whether this call registered it.
    pub(crate) fn register_bean(&self, bean: &BeanRef, factory: &FactoryKey) -> bool {
        let mut info = self.bean_info.lock();
        if info.contains_key(&bean.id()) {
            return false;
        }
        info.insert(bean.id(), (Arc::downgrade(bean), factory.clone()));
        true
    }

    pub fn is_registered(&self, bean: &Bean) -> bool {
        self.bean_info.lock().contains_key(&bean.id())
    }

    /// Factory that produced a bean
    pub fn factory_for_bean(&self, bean: &Bean) -> Option<Arc<BeanFactory>> {
        let key = self.bean_info.lock().get(&bean.id()).map(|(_, k)| k.clone())?;
        self.instances.read().get(&key).cloned()
    }

    /// Key a bean is, or would be, stored under in its factory
    pub fn key_for_bean(&self, bean: &BeanRef, index: Option<&str>) -> Result<Option<Key>> {
        let factory = match self.factory_for_bean(bean) {
            Some(factory) => factory,
            None => self.get_instance(bean.type_name(), None)?,
        };
        factory.key_for_value(&Cached::Bean(bean.clone()), index)
    }

    fn prune_bean_info(&self) {
        self.bean_info
            .lock()
            .retain(|_, (bean, _)| bean.strong_count() > 0);
    }

    /// Keep a value reachable until the next outermost load begins
    pub(crate) fn add_strong_reference(&self, value: &Cached) {
        if let Some(identity) = value.identity() {
            self.strong_references.lock().insert(identity, value.clone());
        }
    }

    pub fn strong_reference_count(&self) -> usize {
        self.strong_references.lock().len()
    }

    pub fn load_stack_depth(&self) -> usize {
        self.load_stack.lock().depth
    }

    /// Push a factory on the load stack for the life of the returned frame
    pub fn enter_load_stack(&self, factory: &BeanFactory) -> LoadStackFrame<'_> {
        self.push_load_stack(factory);
        LoadStackFrame { registry: self }
    }

    fn push_load_stack(&self, factory: &BeanFactory) {
        let (released, to_reset) = {
            let mut stack = self.load_stack.lock();
            let mut released = HashMap::new();
            let mut to_reset = Vec::new();
            if stack.depth == 0 {
                released = std::mem::take(&mut *self.strong_references.lock());
                to_reset = std::mem::take(&mut stack.factories);
            }
            if !stack.factories.contains(factory.key()) {
                stack.factories.push(factory.key().clone());
            }
            stack.depth += 1;
            debug!(
                "{}load stack depth push: {} > {}",
                factory.log_prefix(),
                stack.depth - 1,
                stack.depth
            );
            (released, to_reset)
        };

        for key in to_reset {
            if let Some(previous) = self.instances.read().get(&key).cloned() {
                previous.reset_load_stack();
            }
        }
        if !released.is_empty() {
            drop(released);
            self.prune_bean_info();
        }
    }

    fn pop_load_stack(&self) {
        let mut stack = self.load_stack.lock();
        stack.depth = stack.depth.saturating_sub(1);
        debug!("load stack depth pop: {} > {}", stack.depth + 1, stack.depth);
        if stack.depth == 0 {
            // Marks orphaned by a failed load must not block readers
            self.inflation.clear();
        }
    }

    /// Clear every factory of one kind and data source. Low volatility
    /// factories are kept unless `clear_low_volatility` is set.
    pub fn clear_all_bean_factories(
        &self,
        data_source: &str,
        bean_factory_type: &str,
        clear_low_volatility: bool,
        fire_events: bool,
    ) -> Result<()> {
        debug!(
            "Clearing bean factories for: {} and data source: '{}'",
            bean_factory_type, data_source
        );
        let snapshot = self
            .instances_by_factory_type
            .lock()
            .get(&(bean_factory_type.to_string(), data_source.to_string()))
            .cloned();
        let Some(factories) = snapshot else {
            return Ok(());
        };

        let mut affected = Vec::new();
        for factory in factories {
            if clear_low_volatility || factory.schema().data_volatility == DataLevel::High {
                factory.clear_with(None, false, false)?;
                affected.push(factory);
            }
        }

        if fire_events {
            for factory in affected {
                factory.fire_map_changed(MapEvent::all_rows(factory.key().clone()));
                factory.fire_map_changed(MapEvent::commit(factory.key().clone()));
            }
        }
        Ok(())
    }

    /// Clear the factories of every kind and data source
    pub fn clear_all(&self, clear_low_volatility: bool, fire_events: bool) -> Result<()> {
        let groups: Vec<(String, String)> = self
            .instances_by_factory_type
            .lock()
            .keys()
            .cloned()
            .collect();
        for (bean_factory_type, data_source) in groups {
            self.clear_all_bean_factories(
                &data_source,
                &bean_factory_type,
                clear_low_volatility,
                fire_events,
            )?;
        }
        Ok(())
    }
}

/// Pops the load stack when dropped
pub struct LoadStackFrame<'a> {
    registry: &'a BeanFactoryRegistry,
}

impl Drop for LoadStackFrame<'_> {
    fn drop(&mut self) {
        self.registry.pop_load_stack();
    }
}

use std::sync::Arc;

use crate::error::Result;
use crate::logic::{BeanFactory, BeanFactoryRegistry};
use crate::model::{Bean, BeanRef, Cached, CriterionGroup, Key, Schema};

/// Per-factory hooks supplied by a kind of bean factory
pub trait BeanLoader: Send + Sync {
    /// Fetch a key that missed the cache, returning what is now stored under
    /// it. `Cached::Null` means nothing exists for the key.
    fn load(&self, factory: &BeanFactory, key: &Key, index: Option<&str>) -> Result<Cached>;

    /// Every bean matching the criteria, loading them if necessary
    fn get_objects(&self, factory: &BeanFactory, criteria: &CriterionGroup) -> Result<Vec<BeanRef>>;

    /// Key of a bean for the primary store or a named index
    fn create_key(&self, factory: &BeanFactory, bean: &Bean, index: Option<&str>) -> Option<Key> {
        factory.key_from_properties(bean, index)
    }

    /// Drop loader state tied to the cached contents
    fn clear_impl(&self, _factory: &BeanFactory) {}

    /// Runs once, the first time the factory is handed out
    fn init(&self, _factory: &BeanFactory) -> Result<()> {
        Ok(())
    }

    /// Called when a new outermost load begins after this factory was on the
    /// load stack
    fn reset_load_stack(&self) {}
}

/// A kind of bean factory. Every schema names the kind that caches it; all
/// factories of one kind and data source are created together.
pub trait BeanFactoryType: Send + Sync {
    fn name(&self) -> &str;

    fn create_loader(&self, schema: &Arc<Schema>, data_source: &str) -> Result<Arc<dyn BeanLoader>>;

    /// One-time setup, run the first time any factory of this kind is
    /// requested. `None` means the kind has no such hook.
    fn init_bean_factory_type(
        &self,
        _registry: &BeanFactoryRegistry) -> Option<anyhow::Result<()>> {
        None
    }

    /// One-time setup run once the registry enters its post-init phase
    fn post_init_bean_factory_type(
        &self,
        _registry: &BeanFactoryRegistry) -> Option<anyhow::Result<()>> {
        None
    }
}

/// Factories that never load on their own. Beans arrive through `put` or
/// through notifications.
pub struct DefaultBeanFactoryType;

pub const DEFAULT_FACTORY_TYPE: &str = "default";

impl BeanFactoryType for DefaultBeanFactoryType {
    fn name(&self) -> &str {
        DEFAULT_FACTORY_TYPE
    }

    fn create_loader(
        &self,
        _schema: &Arc<Schema>,
        _data_source: &str,
    ) -> Result<Arc<dyn BeanLoader>> {
        Ok(Arc::new(DefaultBeanLoader))
    }
}

pub struct DefaultBeanLoader;

impl BeanLoader for DefaultBeanLoader {
    fn load(&self, _factory: &BeanFactory, _key: &Key, _index: Option<&str>) -> Result<Cached> {
        Ok(Cached::Null)
    }

    fn get_objects(
        &self,
        factory: &BeanFactory,
        criteria: &CriterionGroup,
    ) -> Result<Vec<BeanRef>> {
        let _guard = factory.lock();
        Ok(factory
            .values()
            .into_iter()
            .filter_map(|v| v.as_bean().cloned())
            .filter(|bean| criteria.evaluate(bean))
            .collect())
    }
}

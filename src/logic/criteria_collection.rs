use std::sync::{Arc, Weak};

use crate::error::{CacheError, Result};
use crate::logic::BeanFactory;
use crate::model::{BeanCollection, BeanRef, CriterionGroup, MapEvent, MapEventKind, MapListener};

struct CriteriaInner {
    factory: Weak<BeanFactory>,
    criteria: CriterionGroup,
    collection: BeanCollection,
}

/// Live collection of a factory's beans matching a criterion group. It
/// follows the factory's change events for as long as any handle to it
/// exists.
#[derive(Clone)]
pub struct CriteriaBeanCollection {
    inner: Arc<CriteriaInner>,
}

impl CriteriaBeanCollection {
    pub(crate) fn new(factory: &Arc<BeanFactory>, criteria: CriterionGroup) -> Result<Self> {
        let collection = BeanCollection::new(factory.type_name());
        let beans = factory.get_objects_matching(&criteria)?;
        for bean in beans {
            collection.add(bean);
        }

        let inner = Arc::new(CriteriaInner {
            factory: Arc::downgrade(factory),
            criteria,
            collection,
        });
        factory.add_map_listener(Arc::new(CriteriaListener {
            target: Arc::downgrade(&inner),
        }));
        Ok(Self { inner })
    }

    pub fn criteria(&self) -> &CriterionGroup {
        &self.inner.criteria
    }

    /// The underlying collection, for registering collection listeners
    pub fn collection(&self) -> &BeanCollection {
        &self.inner.collection
    }

    pub fn len(&self) -> usize {
        self.inner.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.collection.is_empty()
    }

    pub fn to_vec(&self) -> Vec<BeanRef> {
        self.inner.collection.to_vec()
    }

    pub fn contains(&self, bean: &BeanRef) -> bool {
        self.inner.collection.contains(bean.id())
    }

    /// Re-run the criteria against the factory
    pub fn reload(&self) -> Result<()> {
        self.inner.reload()
    }
}

impl CriteriaInner {
    fn reload(&self) -> Result<()> {
        let factory = self.factory.upgrade().ok_or(CacheError::RegistryUnavailable)?;
        let beans = factory.get_objects_matching(&self.criteria)?;
        self.collection.replace_all(beans);
        Ok(())
    }

    fn matches(&self, bean: &BeanRef) -> bool {
        let accepted = match self.factory.upgrade() {
            Some(factory) => factory.accepts(bean.type_name()),
            None => false,
        };
        accepted && self.criteria.evaluate(bean)
    }
}

struct CriteriaListener {
    target: Weak<CriteriaInner>,
}

impl MapListener for CriteriaListener {
    fn map_changed(&self, event: &MapEvent) -> anyhow::Result<()> {
        let Some(inner) = self.target.upgrade() else {
            return Ok(());
        };
        let beans = event.value.as_ref().map(|v| v.beans()).unwrap_or_default();
        match event.kind {
            MapEventKind::Insert | MapEventKind::Update => {
                for bean in beans {
                    if inner.matches(&bean) {
                        inner.collection.add(bean);
                    } else {
                        inner.collection.remove(&bean);
                    }
                }
            }
            MapEventKind::Delete => {
                for bean in beans {
                    inner.collection.remove(&bean);
                }
            }
            MapEventKind::AllRows => inner.reload()?,
            MapEventKind::Commit => inner.collection.fire_commit(),
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }
}

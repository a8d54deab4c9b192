use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::model::{BeanId, BeanRef, TypeName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionEventKind {
    Added,
    Removed,
    /// A batch of changes is complete
    Commit,
    /// Contents were replaced wholesale
    AllRows,
}

#[derive(Debug, Clone)]
pub struct CollectionEvent {
    pub kind: CollectionEventKind,
    pub bean: Option<BeanRef>,
}

pub trait CollectionListener: Send + Sync {
    fn collection_changed(&self, event: &CollectionEvent);
}

struct CollectionInner {
    id: Uuid,
    bean_type: TypeName,
    beans: RwLock<Vec<BeanRef>>,
    listeners: Mutex<Vec<Arc<dyn CollectionListener>>>,
}

/// Growable, listenable sequence of beans. Clones share the same contents.
#[derive(Clone)]
pub struct BeanCollection {
    inner: Arc<CollectionInner>,
}

impl BeanCollection {
    pub fn new(bean_type: impl Into<TypeName>) -> Self {
        Self {
            inner: Arc::new(CollectionInner {
                id: Uuid::new_v4(),
                bean_type: bean_type.into(),
                beans: RwLock::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn bean_type(&self) -> &str {
        &self.inner.bean_type
    }

    pub fn same(&self, other: &BeanCollection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Add a bean unless already present. Returns whether it was added.
    pub fn add(&self, bean: BeanRef) -> bool {
        {
            let mut beans = self.inner.beans.write();
            if beans.iter().any(|b| b.id() == bean.id()) {
                return false;
            }
            beans.push(bean.clone());
        }
        self.fire(CollectionEventKind::Added, Some(bean));
        true
    }

    pub fn remove(&self, bean: &BeanRef) -> bool {
        let removed = {
            let mut beans = self.inner.beans.write();
            let before = beans.len();
            beans.retain(|b| b.id() != bean.id());
            beans.len() != before
        };
        if removed {
            self.fire(CollectionEventKind::Removed, Some(bean.clone()));
        }
        removed
    }

    /// Replace the contents, firing a single ALL_ROWS event
    pub fn replace_all(&self, beans: Vec<BeanRef>) {
        *self.inner.beans.write() = beans;
        self.fire(CollectionEventKind::AllRows, None);
    }

    pub fn contains(&self, id: BeanId) -> bool {
        self.inner.beans.read().iter().any(|b| b.id() == id)
    }

    pub fn get(&self, index: usize) -> Option<BeanRef> {
        self.inner.beans.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.beans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.beans.read().is_empty()
    }

    pub fn to_vec(&self) -> Vec<BeanRef> {
        self.inner.beans.read().clone()
    }

    pub fn fire_commit(&self) {
        self.fire(CollectionEventKind::Commit, None);
    }

    pub fn add_listener(&self, listener: Arc<dyn CollectionListener>) {
        self.inner.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn CollectionListener>) {
        self.inner
            .listeners
            .lock()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn downgrade(&self) -> WeakBeanCollection {
        WeakBeanCollection {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn fire(&self, kind: CollectionEventKind, bean: Option<BeanRef>) {
        let listeners = self.inner.listeners.lock().clone();
        if listeners.is_empty() {
            return;
        }
        let event = CollectionEvent { kind, bean };
        for listener in listeners {
            listener.collection_changed(&event);
        }
    }
}

impl fmt::Debug for BeanCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BeanCollection<{}>({} beans)",
            self.inner.bean_type,
            self.len()
        )
    }
}

/// Non-owning handle to a collection, used by weak and soft stores
#[derive(Clone)]
pub struct WeakBeanCollection {
    id: Uuid,
    inner: Weak<CollectionInner>,
}

impl WeakBeanCollection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn upgrade(&self) -> Option<BeanCollection> {
        self.inner.upgrade().map(|inner| BeanCollection { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bean;

    struct Recorder(Mutex<Vec<CollectionEventKind>>);

    impl CollectionListener for Recorder {
        fn collection_changed(&self, event: &CollectionEvent) {
            self.0.lock().push(event.kind);
        }
    }

    #[test]
    fn test_add_is_idempotent_and_listenable() {
        let collection = BeanCollection::new("Trade");
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        collection.add_listener(recorder.clone());

        let trade = Bean::new("Trade");
        assert!(collection.add(trade.clone()));
        assert!(!collection.add(trade.clone()));
        assert_eq!(collection.len(), 1);
        assert!(collection.contains(trade.id()));

        assert!(collection.remove(&trade));
        assert!(!collection.remove(&trade));
        collection.fire_commit();

        assert_eq!(
            *recorder.0.lock(),
            vec![
                CollectionEventKind::Added,
                CollectionEventKind::Removed,
                CollectionEventKind::Commit
            ]
        );
    }

    #[test]
    fn test_weak_handle_dies_with_collection() {
        let collection = BeanCollection::new("Trade");
        let weak = collection.downgrade();
        assert!(weak.upgrade().is_some());
        drop(collection);
        assert!(weak.upgrade().is_none());
    }
}

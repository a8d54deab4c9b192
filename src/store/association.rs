use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::model::{Bean, Cached, Key, ReferenceType, WeakBeanCollection};

/// Plain key -> value map underlying an [`Association`]. Implementations do
/// no locking of their own.
pub trait AssociationMap: Send {
    fn get(&mut self, key: &Key) -> Option<Cached>;

    fn contains_key(&mut self, key: &Key) -> bool;

    fn insert(&mut self, key: Key, value: Cached) -> Option<Cached>;

    fn remove(&mut self, key: &Key) -> Option<Cached>;

    /// Reverse lookup: the key an already-cached object is stored under
    fn key_for_value(&mut self, value: &Cached) -> Option<Key>;

    fn entries(&mut self) -> Vec<(Key, Cached)>;

    fn len(&mut self) -> usize;

    fn clear(&mut self);

    /// Drop entries whose value is no longer referenced anywhere else and
    /// return their keys
    fn purge(&mut self) -> Vec<Key> {
        Vec::new()
    }

    /// Keys reclaimed as a side effect of earlier calls, not yet reported
    fn take_reclaimed(&mut self) -> Vec<Key> {
        Vec::new()
    }
}

/// Strongly held entries
#[derive(Default)]
pub struct DefaultAssociation {
    entries: BTreeMap<Key, Cached>,
    by_identity: HashMap<Uuid, Key>,
}

impl DefaultAssociation {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssociationMap for DefaultAssociation {
    fn get(&mut self, key: &Key) -> Option<Cached> {
        self.entries.get(key).cloned()
    }

    fn contains_key(&mut self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    fn insert(&mut self, key: Key, value: Cached) -> Option<Cached> {
        let previous = self.entries.remove(&key);
        forget_identity(&mut self.by_identity, previous.as_ref(), &key);
        if let Some(identity) = value.identity() {
            self.by_identity.insert(identity, key.clone());
        }
        self.entries.insert(key, value);
        previous
    }

    fn remove(&mut self, key: &Key) -> Option<Cached> {
        let previous = self.entries.remove(key);
        forget_identity(&mut self.by_identity, previous.as_ref(), key);
        previous
    }

    fn key_for_value(&mut self, value: &Cached) -> Option<Key> {
        self.by_identity.get(&value.identity()?).cloned()
    }

    fn entries(&mut self) -> Vec<(Key, Cached)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn len(&mut self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_identity.clear();
    }
}

fn forget_identity(by_identity: &mut HashMap<Uuid, Key>, previous: Option<&Cached>, key: &Key) {
    if let Some(identity) = previous.and_then(Cached::identity) {
        // The object may since have been stored under another key
        if by_identity.get(&identity) == Some(key) {
            by_identity.remove(&identity);
        }
    }
}

enum RefSlot {
    Null,
    Bean(Weak<Bean>),
    Collection(WeakBeanCollection),
}

impl RefSlot {
    fn downgrade(value: &Cached) -> Self {
        match value {
            Cached::Null => RefSlot::Null,
            Cached::Bean(bean) => RefSlot::Bean(Arc::downgrade(bean)),
            Cached::Collection(collection) => RefSlot::Collection(collection.downgrade()),
        }
    }

    /// `None` once the referent has been dropped
    fn upgrade(&self) -> Option<Cached> {
        match self {
            RefSlot::Null => Some(Cached::Null),
            RefSlot::Bean(bean) => bean.upgrade().map(Cached::Bean),
            RefSlot::Collection(collection) => collection.upgrade().map(Cached::Collection),
        }
    }
}

/// Most recently used entries of a soft store, held strongly
struct SoftPins {
    capacity: usize,
    tick: u64,
    by_key: HashMap<Key, (u64, Cached)>,
    by_tick: BTreeMap<u64, Key>,
}

impl SoftPins {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            by_key: HashMap::new(),
            by_tick: BTreeMap::new(),
        }
    }

    fn touch(&mut self, key: &Key, value: &Cached) {
        if value.is_null() || self.capacity == 0 {
            return;
        }
        self.tick += 1;
        if let Some((old_tick, _)) = self.by_key.insert(key.clone(), (self.tick, value.clone())) {
            self.by_tick.remove(&old_tick);
        }
        self.by_tick.insert(self.tick, key.clone());
        while self.by_key.len() > self.capacity {
            let Some((_, oldest)) = self.by_tick.pop_first() else {
                break;
            };
            self.by_key.remove(&oldest);
        }
    }

    fn unpin(&mut self, key: &Key) {
        if let Some((tick, _)) = self.by_key.remove(key) {
            self.by_tick.remove(&tick);
        }
    }

    fn clear(&mut self) {
        self.by_key.clear();
        self.by_tick.clear();
    }
}

/// Entries held weakly. With soft pins the most recently used entries stay
/// strongly reachable, so they survive until pushed out by newer ones.
pub struct ReferenceAssociation {
    entries: BTreeMap<Key, (RefSlot, Option<Uuid>)>,
    by_identity: HashMap<Uuid, Key>,
    pins: Option<SoftPins>,
    reclaimed: Vec<Key>,
}

impl ReferenceAssociation {
    pub fn weak() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_identity: HashMap::new(),
            pins: None,
            reclaimed: Vec::new(),
        }
    }

    pub fn soft(capacity: usize) -> Self {
        Self {
            pins: Some(SoftPins::new(capacity)),
            ..Self::weak()
        }
    }

    fn drop_entry(&mut self, key: &Key) -> Option<(RefSlot, Option<Uuid>)> {
        let removed = self.entries.remove(key)?;
        if let Some(identity) = removed.1 {
            if self.by_identity.get(&identity) == Some(key) {
                self.by_identity.remove(&identity);
            }
        }
        if let Some(pins) = self.pins.as_mut() {
            pins.unpin(key);
        }
        Some(removed)
    }

    /// Live value for a key, reclaiming the entry if its referent is gone
    fn live(&mut self, key: &Key) -> Option<Cached> {
        let value = self.entries.get(key)?.0.upgrade();
        match value {
            Some(value) => {
                if let Some(pins) = self.pins.as_mut() {
                    pins.touch(key, &value);
                }
                Some(value)
            }
            None => {
                self.drop_entry(key);
                self.reclaimed.push(key.clone());
                None
            }
        }
    }
}

impl AssociationMap for ReferenceAssociation {
    fn get(&mut self, key: &Key) -> Option<Cached> {
        self.live(key)
    }

    fn contains_key(&mut self, key: &Key) -> bool {
        self.live(key).is_some()
    }

    fn insert(&mut self, key: Key, value: Cached) -> Option<Cached> {
        let previous = self.live(&key);
        self.drop_entry(&key);
        let identity = value.identity();
        if let Some(identity) = identity {
            self.by_identity.insert(identity, key.clone());
        }
        if let Some(pins) = self.pins.as_mut() {
            pins.touch(&key, &value);
        }
        self.entries
            .insert(key, (RefSlot::downgrade(&value), identity));
        previous
    }

    fn remove(&mut self, key: &Key) -> Option<Cached> {
        let previous = self.live(key);
        self.drop_entry(key);
        previous
    }

    fn key_for_value(&mut self, value: &Cached) -> Option<Key> {
        let key = self.by_identity.get(&value.identity()?).cloned()?;
        self.live(&key).map(|_| key)
    }

    fn entries(&mut self) -> Vec<(Key, Cached)> {
        self.purge_into_reclaimed();
        self.entries
            .iter()
            .filter_map(|(k, (slot, _))| slot.upgrade().map(|v| (k.clone(), v)))
            .collect()
    }

    fn len(&mut self) -> usize {
        self.purge_into_reclaimed();
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_identity.clear();
        if let Some(pins) = self.pins.as_mut() {
            pins.clear();
        }
    }

    fn purge(&mut self) -> Vec<Key> {
        let dead: Vec<Key> = self
            .entries
            .iter()
            .filter(|(_, (slot, _))| slot.upgrade().is_none())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dead {
            self.drop_entry(key);
        }
        dead
    }

    fn take_reclaimed(&mut self) -> Vec<Key> {
        std::mem::take(&mut self.reclaimed)
    }
}

impl ReferenceAssociation {
    fn purge_into_reclaimed(&mut self) {
        let dead = self.purge();
        self.reclaimed.extend(dead);
    }
}

pub type RemovedListener = Arc<dyn Fn(&Key) + Send + Sync>;

/// Thread-safe key -> value store. Wraps an [`AssociationMap`] in a lock and
/// reports entries reclaimed by weak or soft maps to removed-listeners,
/// outside the lock.
pub struct Association {
    name: String,
    reference_type: ReferenceType,
    map: Mutex<Box<dyn AssociationMap>>,
    removed_listeners: RwLock<Vec<RemovedListener>>,
}

impl Association {
    pub fn new(name: &str, reference_type: ReferenceType, map: Box<dyn AssociationMap>) -> Self {
        Self {
            name: name.to_string(),
            reference_type,
            map: Mutex::new(map),
            removed_listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn strong(name: &str) -> Self {
        Self::new(name, ReferenceType::Strong, Box::new(DefaultAssociation::new()))
    }

    pub fn weak(name: &str) -> Self {
        Self::new(name, ReferenceType::Weak, Box::new(ReferenceAssociation::weak()))
    }

    pub fn soft(name: &str, capacity: usize) -> Self {
        Self::new(
            name,
            ReferenceType::Soft,
            Box::new(ReferenceAssociation::soft(capacity)),
        )
    }

    pub fn with_reference_type(
        name: &str,
        reference_type: ReferenceType,
        soft_capacity: usize,
    ) -> Self {
        match reference_type {
            ReferenceType::Strong => Self::strong(name),
            ReferenceType::Weak => Self::weak(name),
            ReferenceType::Soft => Self::soft(name, soft_capacity),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reference_type(&self) -> ReferenceType {
        self.reference_type
    }

    pub fn add_removed_listener(&self, listener: RemovedListener) {
        self.removed_listeners.write().push(listener);
    }

    fn with_map<R>(&self, f: impl FnOnce(&mut dyn AssociationMap) -> R) -> R {
        let (result, reclaimed) = {
            let mut map = self.map.lock();
            let result = f(map.as_mut());
            (result, map.take_reclaimed())
        };
        self.notify_removed(&reclaimed);
        result
    }

    fn notify_removed(&self, keys: &[Key]) {
        if keys.is_empty() {
            return;
        }
        let listeners = self.removed_listeners.read().clone();
        for key in keys {
            for listener in &listeners {
                listener(key);
            }
        }
    }

    /// Entry for a key. `Some(Cached::Null)` means the key is known to map to
    /// nothing.
    pub fn get(&self, key: &Key) -> Option<Cached> {
        self.with_map(|m| m.get(key))
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.with_map(|m| m.contains_key(key))
    }

    pub fn contains_value(&self, value: &Cached) -> bool {
        self.with_map(|m| m.key_for_value(value).is_some())
    }

    pub fn put(&self, key: Key, value: Cached) -> Option<Cached> {
        self.with_map(|m| m.insert(key, value))
    }

    /// Insert unless the key already has an entry; returns the entry now
    /// stored
    pub fn put_if_absent(&self, key: Key, value: Cached) -> Cached {
        self.with_map(|m| match m.get(&key) {
            Some(existing) => existing,
            None => {
                m.insert(key, value.clone());
                value
            }
        })
    }

    pub fn put_all(&self, entries: Vec<(Key, Cached)>) {
        self.with_map(|m| {
            for (key, value) in entries {
                m.insert(key, value);
            }
        })
    }

    pub fn remove(&self, key: &Key) -> Option<Cached> {
        self.with_map(|m| m.remove(key))
    }

    pub fn key_for_value(&self, value: &Cached) -> Option<Key> {
        self.with_map(|m| m.key_for_value(value))
    }

    pub fn keys(&self) -> Vec<Key> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    pub fn values(&self) -> Vec<Cached> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    pub fn entries(&self) -> Vec<(Key, Cached)> {
        self.with_map(|m| m.entries())
    }

    pub fn len(&self) -> usize {
        self.with_map(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.with_map(|m| m.clear())
    }

    /// Evict every entry whose value is unreferenced outside the cache and
    /// report it to the removed-listeners. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let evicted = {
            let mut map = self.map.lock();
            let mut evicted = map.take_reclaimed();
            evicted.extend(map.purge());
            evicted
        };
        self.notify_removed(&evicted);
        evicted.len()
    }
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Association({}, {:?})", self.name, self.reference_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BeanCollection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_strong_store_reverse_lookup() {
        let store = Association::strong("Trade");
        let trade = Bean::new("Trade");
        store.put(Key::from(1), Cached::Bean(trade.clone()));
        store.put(Key::from(2), Cached::Null);

        assert_eq!(store.key_for_value(&Cached::Bean(trade.clone())), Some(Key::from(1)));
        assert!(store.contains_value(&Cached::Bean(trade.clone())));
        assert!(store.get(&Key::from(2)).unwrap().is_null());
        assert!(store.get(&Key::from(3)).is_none());
        assert_eq!(store.len(), 2);

        store.remove(&Key::from(1));
        assert_eq!(store.key_for_value(&Cached::Bean(trade)), None);
    }

    #[test]
    fn test_weak_store_reclaims_and_notifies() {
        let store = Association::weak("Trade");
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        store.add_removed_listener(Arc::new(move |_key: &Key| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let kept = Bean::new("Trade");
        store.put(Key::from(1), Cached::Bean(kept.clone()));
        store.put(Key::from(2), Cached::Bean(Bean::new("Trade")));
        store.put(Key::from(3), Cached::Null);

        // Key 2 was only referenced by the store
        assert!(store.get(&Key::from(2)).is_none());
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(store.get(&Key::from(1)).is_some());
        // Null entries are not references and survive
        assert!(store.contains_key(&Key::from(3)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_soft_store_pins_recent_entries() {
        let store = Association::soft("Trade", 2);
        for id in 1..=3 {
            store.put(Key::from(id), Cached::Bean(Bean::new("Trade")));
        }

        // Only the two most recent are still strongly held
        assert_eq!(store.sweep(), 1);
        assert!(store.get(&Key::from(1)).is_none());
        assert!(store.get(&Key::from(2)).is_some());
        assert!(store.get(&Key::from(3)).is_some());
    }

    #[test]
    fn test_weak_collections() {
        let store = Association::weak("Trade.byBook");
        let collection = BeanCollection::new("Trade");
        store.put(Key::from("RATES"), Cached::Collection(collection.clone()));
        assert!(store.get(&Key::from("RATES")).is_some());
        drop(collection);
        assert!(store.get(&Key::from("RATES")).is_none());
    }
}

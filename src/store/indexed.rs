use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::model::{BeanCollection, BeanRef, Cached, IndexDef, Key, TypeName};
use crate::store::Association;

/// Secondary view of a bean factory, keyed by a named index.
///
/// Unique indices map a key to a single bean, like the primary store.
/// Non-unique indices map a key to a [`BeanCollection`] that grows and
/// shrinks as beans are added and removed.
pub struct IndexedAssociation {
    type_name: TypeName,
    index: IndexDef,
    store: Association,
    /// Beans record which collection they sit in, so removal needs no scan
    indexable: bool,
    /// Collections changed since the last commit
    to_commit: Mutex<Vec<BeanCollection>>,
}

impl IndexedAssociation {
    pub fn new(type_name: &str, index: IndexDef, store: Association, indexable: bool) -> Self {
        Self {
            type_name: type_name.to_string(),
            index,
            store,
            indexable,
            to_commit: Mutex::new(Vec::new()),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.index.name
    }

    pub fn index(&self) -> &IndexDef {
        &self.index
    }

    pub fn is_unique(&self) -> bool {
        self.index.unique
    }

    pub fn store(&self) -> &Association {
        &self.store
    }

    pub fn get(&self, key: &Key) -> Option<Cached> {
        self.store.get(key)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.store.contains_key(key)
    }

    /// Back-reference slot on the bean. Qualified by type because the same
    /// bean sits in the indices of every factory in its hierarchy.
    fn membership_name(&self) -> &str {
        self.store.name()
    }

    /// Store a value under an index key. For non-unique indices the value is
    /// added to the key's collection, which is created on first use and
    /// returned so the caller can keep it reachable.
    pub fn put(&self, key: Key, value: Cached) -> Result<Option<BeanCollection>> {
        if self.is_unique() {
            self.store.put(key, value);
            return Ok(None);
        }

        match self.store.get(&key) {
            Some(Cached::Collection(existing)) => {
                match value {
                    Cached::Collection(_) => {
                        return Err(CacheError::IndexedEntryReplaced {
                            type_name: self.type_name.clone(),
                            index: self.index.name.clone(),
                        })
                    }
                    Cached::Bean(bean) => self.add_to(&existing, bean),
                    Cached::Null => {}
                }
                Ok(None)
            }
            _ => {
                let collection = match value {
                    Cached::Collection(collection) => {
                        for bean in collection.to_vec() {
                            self.remember(&bean, &collection);
                        }
                        collection
                    }
                    Cached::Bean(bean) => {
                        let collection = BeanCollection::new(self.type_name.clone());
                        self.add_to(&collection, bean);
                        collection
                    }
                    Cached::Null => BeanCollection::new(self.type_name.clone()),
                };
                self.store.put(key, Cached::Collection(collection.clone()));
                Ok(Some(collection))
            }
        }
    }

    fn add_to(&self, collection: &BeanCollection, bean: BeanRef) {
        if collection.add(bean.clone()) {
            self.to_commit.lock().push(collection.clone());
            self.remember(&bean, collection);
        }
    }

    fn remember(&self, bean: &BeanRef, collection: &BeanCollection) {
        if self.indexable {
            bean.set_indexed_value(self.membership_name(), Some(collection.clone()));
        }
    }

    /// Remove a value from this index wherever it is stored, returning the
    /// key it was found under
    pub fn remove_value(&self, value: &Cached) -> Option<Key> {
        if self.is_unique() {
            let key = self.store.key_for_value(value)?;
            self.store.remove(&key);
            return Some(key);
        }

        let bean = value.as_bean()?;
        let found = if self.indexable {
            bean.indexed_value(self.membership_name())
        } else {
            self.store
                .values()
                .into_iter()
                .filter_map(|v| v.as_collection().cloned())
                .find(|c| c.contains(bean.id()))
        };
        let collection = found?;

        if collection.remove(bean) {
            self.to_commit.lock().push(collection.clone());
        }
        if self.indexable {
            bean.set_indexed_value(self.membership_name(), None);
        }
        self.store.key_for_value(&Cached::Collection(collection))
    }

    pub fn clear(&self) {
        if !self.is_unique() && self.indexable {
            for value in self.store.values() {
                for bean in value.beans() {
                    bean.set_indexed_value(self.membership_name(), None);
                }
            }
        }
        self.store.clear();
        self.to_commit.lock().clear();
    }

    /// Fire a commit on every collection changed since the last call
    pub fn commit_collections(&self) {
        let pending = std::mem::take(&mut *self.to_commit.lock());
        let mut committed: Vec<BeanCollection> = Vec::with_capacity(pending.len());
        for collection in pending {
            if committed.iter().any(|c| c.same(&collection)) {
                continue;
            }
            collection.fire_commit();
            committed.push(collection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bean;

    fn by_book(indexable: bool) -> IndexedAssociation {
        IndexedAssociation::new(
            "Trade",
            IndexDef::new("byBook", false, &["BOOK_ID"]),
            Association::strong("Trade.byBook"),
            indexable,
        )
    }

    #[test]
    fn test_one_to_many_put_and_remove() {
        for indexable in [true, false] {
            let index = by_book(indexable);
            let first = Bean::new("Trade");
            let second = Bean::new("Trade");

            let created = index.put(Key::from(7), Cached::Bean(first.clone())).unwrap();
            assert!(created.is_some());
            assert!(index.put(Key::from(7), Cached::Bean(second.clone())).unwrap().is_none());

            let collection = index.get(&Key::from(7)).unwrap();
            assert_eq!(collection.as_collection().unwrap().len(), 2);
            assert_eq!(first.indexed_value("Trade.byBook").is_some(), indexable);

            assert_eq!(index.remove_value(&Cached::Bean(first.clone())), Some(Key::from(7)));
            assert_eq!(collection.as_collection().unwrap().len(), 1);
            assert!(first.indexed_value("Trade.byBook").is_none());
        }
    }

    #[test]
    fn test_replacing_collection_is_an_error() {
        let index = by_book(true);
        index.put(Key::from(1), Cached::Bean(Bean::new("Trade"))).unwrap();
        let result = index.put(Key::from(1), Cached::Collection(BeanCollection::new("Trade")));
        assert!(matches!(result, Err(CacheError::IndexedEntryReplaced { .. })));
    }

    #[test]
    fn test_unique_index() {
        let index = IndexedAssociation::new(
            "Trade",
            IndexDef::new("byReference", true, &["REFERENCE"]),
            Association::strong("Trade.byReference"),
            true,
        );
        let trade = Bean::new("Trade");
        index.put(Key::from("T-1"), Cached::Bean(trade.clone())).unwrap();
        assert!(index.get(&Key::from("T-1")).unwrap().as_bean().is_some());
        assert_eq!(index.remove_value(&Cached::Bean(trade)), Some(Key::from("T-1")));
        assert!(!index.contains_key(&Key::from("T-1")));
    }
}

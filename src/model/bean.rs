use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::model::{BeanCollection, TypeName, Value, WeakBeanCollection};

/// Stable identity assigned to a bean at allocation. Side tables (owning
/// factory, partial inflation marks, strong references) are keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeanId(Uuid);

impl BeanId {
    pub fn new() -> Self {
        BeanId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for BeanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BeanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type BeanRef = Arc<Bean>;

/// A cached domain object: a typed bag of property values
pub struct Bean {
    id: BeanId,
    type_name: TypeName,
    properties: RwLock<HashMap<String, Value>>,
    /// Collections of one-to-many indices this bean currently belongs to,
    /// keyed by index name. Held weakly: the collection already holds the bean.
    indexed_values: Mutex<HashMap<String, WeakBeanCollection>>,
}

impl Bean {
    pub fn new(type_name: impl Into<TypeName>) -> BeanRef {
        Arc::new(Self {
            id: BeanId::new(),
            type_name: type_name.into(),
            properties: RwLock::new(HashMap::new()),
            indexed_values: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> BeanId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Property value with lazy values resolved
    pub fn get(&self, name: &str) -> Value {
        // Clone out before resolving; a load may touch this bean again
        let value = self.get_raw(name);
        value.resolve()
    }

    /// Property value as stored, without resolving lazy values
    pub fn get_raw(&self, name: &str) -> Value {
        self.properties.read().get(name).cloned().unwrap_or_default()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.write().insert(name.into(), value.into());
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.properties.read().contains_key(name)
    }

    pub fn property_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.properties.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Read a dotted property path such as `instrument.currency.code`. Any
    /// null along the way yields null.
    pub fn get_path(&self, path: &str) -> Value {
        let mut parts = path.split('.');
        let Some(first) = parts.next() else {
            return Value::Null;
        };
        let mut value = self.get(first);
        for part in parts {
            value = match value {
                Value::Bean(bean) => bean.get(part),
                _ => return Value::Null,
            };
        }
        value
    }

    pub fn indexed_value(&self, index_name: &str) -> Option<BeanCollection> {
        self.indexed_values
            .lock()
            .get(index_name)
            .and_then(WeakBeanCollection::upgrade)
    }

    pub fn set_indexed_value(&self, index_name: &str, collection: Option<BeanCollection>) {
        let mut indexed = self.indexed_values.lock();
        match collection {
            Some(collection) => {
                indexed.insert(index_name.to_string(), collection.downgrade());
            }
            None => {
                indexed.remove(index_name);
            }
        }
    }
}

impl fmt::Debug for Bean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Property values may point back at this bean, so only identity is printed
        f.debug_struct("Bean")
            .field("type", &self.type_name)
            .field("id", &self.id)
            .finish()
    }
}

impl fmt::Display for Bean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.type_name, self.id)
    }
}

/// Callbacks a bean type may opt into, fired once per batch after inflation
pub trait BeanLifecycle: Send + Sync {
    fn init(&self, _bean: &BeanRef) -> anyhow::Result<()> {
        Ok(())
    }

    fn inserted(&self, _bean: &BeanRef) -> anyhow::Result<()> {
        Ok(())
    }

    fn updated(&self, _bean: &BeanRef) -> anyhow::Result<()> {
        Ok(())
    }

    fn deleted(&self, _bean: &BeanRef) -> anyhow::Result<()> {
        Ok(())
    }
}

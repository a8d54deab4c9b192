use log::error;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use crate::logic::BeanFactory;
use crate::model::{Key, Load, Value, ValueConstructor};

/// Loads that become resolvable together. The first access to any member
/// resolves all of them inside one load-stack frame, so every bean of the
/// cascade stays strongly reachable until the next outermost load.
#[derive(Default)]
pub struct LoadGroup {
    loads: Mutex<Vec<Weak<BeanFactoryLoad>>>,
    loaded: AtomicBool,
}

impl LoadGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, load: &Arc<BeanFactoryLoad>) {
        self.loads.lock().push(Arc::downgrade(load));
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.loads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every load still alive. Only the first call does anything.
    pub fn set_loaded(&self) {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return;
        }
        let loads: Vec<Arc<BeanFactoryLoad>> = self
            .loads
            .lock()
            .drain(..)
            .filter_map(|load| load.upgrade())
            .collect();
        for load in loads {
            load.load();
        }
    }
}

/// Threads a `BeanFactoryLoad` remembers values for. The memo starts over
/// once it is full; a forgotten value is looked up in the factory again.
const MEMOIZED_THREADS: usize = 64;

/// Deferred lookup of a key in a bean factory, memoized per thread
pub struct BeanFactoryLoad {
    factory: Weak<BeanFactory>,
    key: Key,
    index: Option<String>,
    group: Mutex<Option<Arc<LoadGroup>>>,
    values: Mutex<HashMap<ThreadId, Value>>,
}

impl BeanFactoryLoad {
    pub fn new(
        factory: &Arc<BeanFactory>,
        key: Key,
        index: Option<&str>,
        group: Option<Arc<LoadGroup>>,
    ) -> Arc<Self> {
        let load = Arc::new(Self {
            factory: Arc::downgrade(factory),
            key,
            index: index.map(str::to_string),
            group: Mutex::new(group.clone()),
            values: Mutex::new(HashMap::new()),
        });
        if let Some(group) = group {
            group.add(&load);
        }
        load
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }

    pub fn group(&self) -> Option<Arc<LoadGroup>> {
        self.group.lock().clone()
    }

    /// Number of threads with a memoized value
    pub fn memoized(&self) -> usize {
        self.values.lock().len()
    }

    fn set(&self, factory: &BeanFactory) -> Value {
        match factory.get(&self.key, self.index.as_deref()) {
            Ok(value) => value.to_value(),
            Err(e) => {
                error!(
                    "{}error loading key {}: {:#}",
                    factory.log_prefix(),
                    self.key,
                    e
                );
                Value::Null
            }
        }
    }
}

impl Load for BeanFactoryLoad {
    fn load(&self) -> Value {
        let me = thread::current().id();
        if let Some(value) = self.values.lock().get(&me) {
            return value.clone();
        }
        let Some(factory) = self.factory.upgrade() else {
            return Value::Null;
        };

        let group = self.group.lock().clone();
        let value = match group {
            Some(group) if !group.is_loaded() => match factory.registry() {
                Ok(registry) => {
                    let _frame = registry.enter_load_stack(&factory);
                    let value = self.set(&factory);
                    group.set_loaded();
                    value
                }
                Err(_) => self.set(&factory),
            },
            _ => self.set(&factory),
        };

        let mut values = self.values.lock();
        if values.len() >= MEMOIZED_THREADS {
            values.clear();
        }
        values.insert(me, value.clone());
        value
    }

    fn reset(&self) {
        *self.group.lock() = None;
        self.values.lock().clear();
    }
}

/// Deferred call to a registered constructor with arguments captured at
/// inflation time
pub struct ConstructorLoad {
    name: String,
    constructor: ValueConstructor,
    arguments: Vec<Value>,
    value: Mutex<Option<Value>>,
}

impl ConstructorLoad {
    pub fn new(name: &str, constructor: ValueConstructor, arguments: Vec<Value>) -> Self {
        Self {
            name: name.to_string(),
            constructor,
            arguments,
            value: Mutex::new(None),
        }
    }
}

impl Load for ConstructorLoad {
    fn load(&self) -> Value {
        if let Some(value) = self.value.lock().as_ref() {
            return value.clone();
        }
        let value = match (self.constructor)(&self.arguments) {
            Ok(value) => value,
            Err(e) => {
                error!("error constructing {}: {:#}", self.name, e);
                Value::Null
            }
        };
        *self.value.lock() = Some(value.clone());
        value
    }

    fn reset(&self) {
        *self.value.lock() = None;
    }
}

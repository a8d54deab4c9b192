use log::error;
use std::collections::HashMap;
use std::sync::Arc;

use crate::logic::{BeanFactory, BeanFactoryLoad, BeanFactoryRegistry, ConstructorLoad, LoadGroup};
use crate::model::{
    BeanRef, Cardinality, Column, ConstructorProperty, ForeignKeyProperty, Key, LazyValue,
    Parameter, Property, Schema, Value, ValueConstructor,
};

/// Raw column values saved for one bean during the first pass
pub(crate) type CachedColumns = HashMap<Column, Value>;

/// Value of one parameter for a bean being inflated
pub(crate) fn parameter_value(
    bean: &BeanRef,
    columns: Option<&CachedColumns>,
    parameter: &Parameter,
) -> Value {
    match parameter {
        Parameter::Property { path } => bean.get_path(path),
        Parameter::Column { column, data_type } => {
            let value = columns
                .and_then(|c| c.get(column))
                .cloned()
                .unwrap_or_default();
            match data_type {
                Some(data_type) => value.coerce(*data_type),
                None => value,
            }
        }
        Parameter::Default { value, data_type } => Parameter::constant_value(value, *data_type),
    }
}

/// One derived property applied to a batch of beans, with whatever it
/// resolved up front shared across the batch
pub(crate) enum PropertyRun<'a> {
    ForeignKey(ForeignKeyRun<'a>),
    Constructor(ConstructorRun<'a>),
}

impl<'a> PropertyRun<'a> {
    /// Prepare a derived property for a batch inflated by `parent`. `None`
    /// for plain properties and for properties that cannot be resolved,
    /// which are logged.
    pub(crate) fn new(
        registry: &'a BeanFactoryRegistry,
        parent: &BeanFactory,
        property: &'a Property,
    ) -> Option<Self> {
        match property {
            Property::Default(_) => None,
            Property::ForeignKey(fk) => {
                ForeignKeyRun::new(registry, parent, fk).map(PropertyRun::ForeignKey)
            }
            Property::Constructor(ctor) => {
                ConstructorRun::new(registry, parent, ctor).map(PropertyRun::Constructor)
            }
        }
    }

    pub(crate) fn apply(&mut self, bean: &BeanRef, columns: Option<&CachedColumns>) {
        match self {
            PropertyRun::ForeignKey(run) => run.apply(bean, columns),
            PropertyRun::Constructor(run) => run.apply(bean, columns),
        }
    }
}

fn set_value(registry: &BeanFactoryRegistry, bean: &BeanRef, name: &str, value: Value) {
    // A property that was set before must be able to go back to null
    if !value.is_null() || bean.is_set(name) {
        registry.schemas().set_property(bean, name, value);
    }
}

pub(crate) struct ForeignKeyRun<'a> {
    registry: &'a BeanFactoryRegistry,
    property: &'a ForeignKeyProperty,
    target: Arc<BeanFactory>,
    key_columns: Vec<Column>,
    /// Small, static targets are always resolved straight away
    eager: bool,
    group: Arc<LoadGroup>,
    loads: HashMap<Key, Arc<BeanFactoryLoad>>,
}

impl<'a> ForeignKeyRun<'a> {
    fn new(
        registry: &'a BeanFactoryRegistry,
        parent: &BeanFactory,
        property: &'a ForeignKeyProperty,
    ) -> Option<Self> {
        let invalid = |reason: String| {
            error!(
                "{}invalid foreign key property {}: {}",
                parent.log_prefix(),
                property.name,
                reason
            );
        };

        let target_schema = match registry.schemas().get(&property.type_name) {
            Ok(schema) => schema,
            Err(e) => {
                invalid(e.to_string());
                return None;
            }
        };
        if let Err(reason) = check_foreign_key(&target_schema, property) {
            invalid(reason);
            return None;
        }
        let key_columns = match target_schema.key_columns(property.foreign_index.as_deref()) {
            Ok(columns) => columns,
            Err(e) => {
                invalid(e.to_string());
                return None;
            }
        };

        // Same kind of factory: same data source as the parent
        let data_source = if target_schema.bean_factory_type == parent.schema().bean_factory_type {
            Some(parent.data_source())
        } else {
            None
        };
        let target = match registry.get_instance(&property.type_name, data_source) {
            Ok(target) => target,
            Err(e) => {
                invalid(e.to_string());
                return None;
            }
        };

        Some(Self {
            registry,
            property,
            eager: target_schema.is_low_quantity_and_volatility(),
            target,
            key_columns,
            group: LoadGroup::new(),
            loads: HashMap::new(),
        })
    }

    fn apply(&mut self, bean: &BeanRef, columns: Option<&CachedColumns>) {
        let name = self.property.target_property_name();
        let arguments: Vec<Value> = self
            .property
            .parameters
            .iter()
            .map(|p| parameter_value(bean, columns, p))
            .collect();
        let Some(key) = Key::from_values(&arguments) else {
            set_value(self.registry, bean, &name, Value::Null);
            return;
        };
        let key = self.target.schema().change_key_type(&key, &self.key_columns);
        let index = self.property.foreign_index.as_deref();

        let value = if self.eager
            || !self.property.lazy
            || self.target.is_fully_inflated_key(&key, index)
        {
            match self.target.get(&key, index) {
                Ok(value) => value.to_value(),
                Err(e) => {
                    error!(
                        "{}error resolving {} for key {}: {:#}",
                        self.target.log_prefix(),
                        self.property.name,
                        key,
                        e
                    );
                    Value::Null
                }
            }
        } else {
            let load = self
                .loads
                .entry(key.clone())
                .or_insert_with(|| {
                    BeanFactoryLoad::new(&self.target, key, index, Some(self.group.clone()))
                })
                .clone();
            Value::Lazy(LazyValue::new(self.property.type_name.clone(), load))
        };
        set_value(self.registry, bean, &name, value);
    }
}

/// Why a foreign key property cannot be resolved against its target, if it
/// cannot
pub(crate) fn check_foreign_key(
    target: &Schema,
    property: &ForeignKeyProperty) -> std::result::Result<(), String> {
    let index = match property.foreign_index.as_deref() {
        Some(name) => match target.index(name) {
            Some(index) => Some(index),
            None => return Err(format!("no index {} on {}", name, target.type_name)),
        },
        None => None,
    };
    match (property.cardinality, index) {
        (Cardinality::Many, None) => {
            return Err("a to-many property needs a non-unique index".to_string())
        }
        (Cardinality::Many, Some(index)) if index.unique => {
            return Err(format!("index {} is unique", index.name))
        }
        (Cardinality::One, Some(index)) if !index.unique => {
            return Err(format!("index {} is not unique", index.name))
        }
        _ => {}
    }
    let key_columns = match index {
        Some(index) => index.columns.len(),
        None => target.primary_key.len(),
    };
    if key_columns != property.parameters.len() {
        return Err(format!(
            "{} parameters for {} key columns",
            property.parameters.len(),
            key_columns
        ));
    }
    Ok(())
}

pub(crate) struct ConstructorRun<'a> {
    registry: &'a BeanFactoryRegistry,
    property: &'a ConstructorProperty,
    constructor: ValueConstructor,
    log_prefix: String,
}

impl<'a> ConstructorRun<'a> {
    fn new(
        registry: &'a BeanFactoryRegistry,
        parent: &BeanFactory,
        property: &'a ConstructorProperty,
    ) -> Option<Self> {
        let Some(constructor) = registry.schemas().constructor(&property.constructor) else {
            error!(
                "{}invalid property {}: no constructor registered as {}",
                parent.log_prefix(),
                property.name,
                property.constructor
            );
            return None;
        };
        Some(Self {
            registry,
            property,
            constructor,
            log_prefix: parent.log_prefix().to_string(),
        })
    }

    fn apply(&mut self, bean: &BeanRef, columns: Option<&CachedColumns>) {
        let arguments: Vec<Value> = self
            .property
            .parameters
            .iter()
            .map(|p| parameter_value(bean, columns, p))
            .collect();
        if arguments.iter().any(Value::is_null) {
            set_value(self.registry, bean, &self.property.name, Value::Null);
            return;
        }

        let value = if self.property.lazy {
            let load =
                ConstructorLoad::new(&self.property.name, self.constructor.clone(), arguments);
            Value::Lazy(LazyValue::new(self.property.type_name.clone(), Arc::new(load)))
        } else {
            match (self.constructor)(&arguments) {
                Ok(value) => value,
                Err(e) => {
                    error!(
                        "{}error constructing {} for {}: {:#}",
                        self.log_prefix, self.property.name, bean, e
                    );
                    Value::Null
                }
            }
        };
        set_value(self.registry, bean, &self.property.name, value);
    }
}

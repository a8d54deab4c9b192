use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::model::schema::merge_properties;
use crate::model::{Bean, BeanLifecycle, Property, Schema, TypeName, Value};

/// Builds a derived value from its ordered arguments
pub type ValueConstructor = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

pub type PropertyGetter = Arc<dyn Fn(&Bean, &str) -> Value + Send + Sync>;
pub type PropertySetter = Arc<dyn Fn(&Bean, &str, Value) + Send + Sync>;

/// Accessor pair for one property of one type, resolved when the registry is
/// built
#[derive(Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    getter: PropertyGetter,
    setter: PropertySetter,
}

impl PropertyDescriptor {
    fn field(name: &str) -> Self {
        Self {
            name: name.to_string(),
            getter: Arc::new(|bean: &Bean, name: &str| bean.get(name)),
            setter: Arc::new(|bean: &Bean, name: &str, value: Value| bean.set(name, value)),
        }
    }

    pub fn get(&self, bean: &Bean) -> Value {
        (self.getter)(bean, &self.name)
    }

    pub fn set(&self, bean: &Bean, value: Value) {
        (self.setter)(bean, &self.name, value)
    }
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyDescriptor({})", self.name)
    }
}

/// Read-mostly metadata for every bean type, populated once at startup
pub struct SchemaRegistry {
    schemas: HashMap<TypeName, Arc<Schema>>,
    /// Declaration order, used when creating sibling factories
    order: Vec<TypeName>,
    /// Declared type -> type whose schema (and cache) it shares
    aliases: HashMap<TypeName, TypeName>,
    constructors: HashMap<String, ValueConstructor>,
    lifecycles: HashMap<TypeName, Arc<dyn BeanLifecycle>>,
    descriptors: HashMap<(TypeName, String), PropertyDescriptor>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaRegistryBuilder {
        SchemaRegistryBuilder::default()
    }

    /// Resolve a declared type name to the type its cache is keyed by
    pub fn resolve_type_name(&self, type_name: &str) -> Result<TypeName> {
        let resolved = self
            .aliases
            .get(type_name)
            .map(String::as_str)
            .unwrap_or(type_name);
        if self.schemas.contains_key(resolved) {
            Ok(resolved.to_string())
        } else {
            Err(CacheError::MissingSchema(type_name.to_string()))
        }
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<Schema>> {
        let resolved = self.resolve_type_name(type_name)?;
        self.schemas
            .get(&resolved)
            .cloned()
            .ok_or(CacheError::MissingSchema(resolved))
    }

    pub fn has_schema(&self, type_name: &str) -> bool {
        self.resolve_type_name(type_name).is_ok()
    }

    pub fn type_names(&self) -> &[TypeName] {
        &self.order
    }

    /// Every schema cached by the given kind of bean factory, in declaration
    /// order
    pub fn schemas_for_factory_type(&self, bean_factory_type: &str) -> Vec<Arc<Schema>> {
        self.order
            .iter()
            .filter_map(|t| self.schemas.get(t))
            .filter(|s| s.bean_factory_type == bean_factory_type)
            .cloned()
            .collect()
    }

    pub fn constructor(&self, name: &str) -> Option<ValueConstructor> {
        self.constructors.get(name).cloned()
    }

    pub fn lifecycle(&self, type_name: &str) -> Option<Arc<dyn BeanLifecycle>> {
        self.lifecycles.get(type_name).cloned()
    }

    /// Accessor for a property of a type. Properties without a registered
    /// accessor read and write the bean's property map.
    pub fn descriptor(&self, type_name: &str, property: &str) -> PropertyDescriptor {
        self.descriptors
            .get(&(type_name.to_string(), property.to_string()))
            .cloned()
            .unwrap_or_else(|| PropertyDescriptor::field(property))
    }

    pub fn set_property(&self, bean: &Bean, property: &str, value: Value) {
        self.descriptor(bean.type_name(), property).set(bean, value)
    }

    pub fn get_property(&self, bean: &Bean, property: &str) -> Value {
        self.descriptor(bean.type_name(), property).get(bean)
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("types", &self.order)
            .field("aliases", &self.aliases)
            .finish()
    }
}

#[derive(Default)]
pub struct SchemaRegistryBuilder {
    schemas: Vec<Schema>,
    aliases: HashMap<TypeName, TypeName>,
    constructors: HashMap<String, ValueConstructor>,
    lifecycles: HashMap<TypeName, Arc<dyn BeanLifecycle>>,
    accessors: HashMap<(TypeName, String), (PropertyGetter, PropertySetter)>,
}

impl SchemaRegistryBuilder {
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Add every schema from a JSON array of schema definitions
    pub fn json(mut self, json: &str) -> Result<Self> {
        let schemas: Vec<Schema> = serde_json::from_str(json)?;
        self.schemas.extend(schemas);
        Ok(self)
    }

    /// Make `declared` share the schema and cache of `target`
    pub fn alias(mut self, declared: &str, target: &str) -> Self {
        self.aliases.insert(declared.to_string(), target.to_string());
        self
    }

    pub fn constructor<F>(mut self, name: &str, constructor: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.constructors.insert(name.to_string(), Arc::new(constructor));
        self
    }

    pub fn lifecycle(mut self, type_name: &str, lifecycle: Arc<dyn BeanLifecycle>) -> Self {
        self.lifecycles.insert(type_name.to_string(), lifecycle);
        self
    }

    pub fn accessor<G, S>(mut self, type_name: &str, property: &str, getter: G, setter: S) -> Self
    where
        G: Fn(&Bean, &str) -> Value + Send + Sync + 'static,
        S: Fn(&Bean, &str, Value) + Send + Sync + 'static,
    {
        self.accessors.insert(
            (type_name.to_string(), property.to_string()),
            (Arc::new(getter), Arc::new(setter)),
        );
        self
    }

    /// Validate the hierarchy, fold inherited properties into sub-types and
    /// resolve the property descriptor table
    pub fn build(self) -> Result<SchemaRegistry> {
        let order: Vec<TypeName> = self.schemas.iter().map(|s| s.type_name.clone()).collect();
        let mut raw: HashMap<TypeName, Schema> = HashMap::new();
        for schema in self.schemas {
            if raw.contains_key(&schema.type_name) {
                return Err(CacheError::InvalidSchema {
                    type_name: schema.type_name.clone(),
                    reason: "declared more than once".to_string(),
                });
            }
            raw.insert(schema.type_name.clone(), schema);
        }

        // Chain from each type up to its root, checking every link exists
        let mut chains: HashMap<TypeName, Vec<TypeName>> = HashMap::new();
        for type_name in &order {
            let mut chain = Vec::new();
            let mut current = raw.get(type_name).and_then(|s| s.super_type.clone());
            while let Some(super_type) = current {
                if super_type == *type_name || chain.contains(&super_type) {
                    return Err(CacheError::InvalidSchema {
                        type_name: type_name.clone(),
                        reason: "cyclic super type chain".to_string(),
                    });
                }
                let Some(super_schema) = raw.get(&super_type) else {
                    return Err(CacheError::InvalidSchema {
                        type_name: type_name.clone(),
                        reason: format!("unknown super type '{}'", super_type),
                    });
                };
                current = super_schema.super_type.clone();
                chain.push(super_type);
            }
            chains.insert(type_name.clone(), chain);
        }

        let mut built: HashMap<TypeName, Schema> = HashMap::new();
        for type_name in &order {
            let Some(mut schema) = raw.get(type_name).cloned() else {
                continue;
            };
            let chain = chains.get(type_name).cloned().unwrap_or_default();

            // Walk from the root down so nearer super types override
            let mut properties: Vec<Property> = Vec::new();
            for super_type in chain.iter().rev() {
                if let Some(super_schema) = raw.get(super_type) {
                    properties = merge_properties(&properties, &super_schema.properties);
                    if schema.primary_key.is_empty() {
                        schema.primary_key = super_schema.primary_key.clone();
                    }
                }
            }
            schema.properties = merge_properties(&properties, &schema.properties);
            schema.ancestor_type = chain.last().cloned();

            let mut sub_classes: Vec<TypeName> = raw
                .values()
                .filter(|s| s.super_type.as_deref() == Some(type_name.as_str()))
                .map(|s| s.type_name.clone())
                .collect();
            sub_classes.sort();
            schema.sub_classes = sub_classes;

            for mapping in &schema.sub_class_mappings {
                if !raw.contains_key(&mapping.sub_class) {
                    return Err(CacheError::InvalidSchema {
                        type_name: type_name.clone(),
                        reason: format!(
                            "sub-class mapping to unknown type '{}'",
                            mapping.sub_class
                        ),
                    });
                }
            }

            built.insert(type_name.clone(), schema);
        }

        for (declared, target) in &self.aliases {
            if !built.contains_key(target) {
                return Err(CacheError::InvalidSchema {
                    type_name: declared.clone(),
                    reason: format!("alias of unknown type '{}'", target),
                });
            }
        }

        let mut descriptors = HashMap::new();
        for schema in built.values() {
            for property in &schema.properties {
                let key = (schema.type_name.clone(), property.name().to_string());
                let descriptor = match self.accessors.get(&key) {
                    Some((getter, setter)) => PropertyDescriptor {
                        name: property.name().to_string(),
                        getter: getter.clone(),
                        setter: setter.clone(),
                    },
                    None => PropertyDescriptor::field(property.name()),
                };
                descriptors.insert(key, descriptor);
            }
        }

        Ok(SchemaRegistry {
            schemas: built.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
            order,
            aliases: self.aliases,
            constructors: self.constructors,
            lifecycles: self.lifecycles,
            descriptors,
        })
    }
}

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::model::{Column, DataType, TypeName, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Cardinality {
    One,
    Many,
}

/// Input to a derived property. Order within a property's parameter list is
/// the argument order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Parameter {
    /// A (possibly dotted) property path on the bean being inflated
    Property { path: String },
    /// A raw column value saved during the first pass
    Column {
        column: Column,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_type: Option<DataType>,
    },
    /// A typed constant. The literal `NULL` stands for null.
    Default { value: String, data_type: DataType },
}

impl Parameter {
    pub fn column(name: &str) -> Self {
        Parameter::Column {
            column: Column::new(name),
            data_type: None,
        }
    }

    pub fn property(path: &str) -> Self {
        Parameter::Property {
            path: path.to_string(),
        }
    }

    pub fn constant(value: &str, data_type: DataType) -> Self {
        Parameter::Default {
            value: value.to_string(),
            data_type,
        }
    }

    /// Value of a `Default` parameter
    pub fn constant_value(value: &str, data_type: DataType) -> Value {
        if value == "NULL" {
            Value::Null
        } else {
            Value::Text(value.to_string()).coerce(data_type)
        }
    }
}

/// Property bound to exactly one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultProperty {
    pub name: String,
    pub column: Column,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
}

/// Property whose value is built by a registered constructor from its
/// parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructorProperty {
    pub name: String,
    /// Type of the constructed value
    pub type_name: TypeName,
    /// Name the constructor function is registered under
    pub constructor: String,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub lazy: bool,
}

/// Property resolving to another bean, or a collection of beans, through the
/// target type's bean factory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyProperty {
    pub name: String,
    /// Type of the related bean
    pub type_name: TypeName,
    pub cardinality: Cardinality,
    /// Index on the target used for the lookup; the primary key if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_index: Option<String>,
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub lazy: bool,
}

impl ForeignKeyProperty {
    /// Name the value is stored under on the bean
    pub fn target_property_name(&self) -> String {
        match self.cardinality {
            Cardinality::One => self.name.clone(),
            Cardinality::Many => format!("{}Collection", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Property {
    Default(DefaultProperty),
    Constructor(ConstructorProperty),
    ForeignKey(ForeignKeyProperty),
}

impl Property {
    pub fn default_property(name: &str, column: &str, data_type: Option<DataType>) -> Self {
        Property::Default(DefaultProperty {
            name: name.to_string(),
            column: Column::new(column),
            data_type,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Property::Default(p) => &p.name,
            Property::Constructor(p) => &p.name,
            Property::ForeignKey(p) => &p.name,
        }
    }

    pub fn is_derived(&self) -> bool {
        !matches!(self, Property::Default(_))
    }

    pub fn is_lazy(&self) -> bool {
        match self {
            Property::Default(_) => false,
            Property::Constructor(p) => p.lazy,
            Property::ForeignKey(p) => p.lazy,
        }
    }

    pub fn parameters(&self) -> &[Parameter] {
        match self {
            Property::Default(_) => &[],
            Property::Constructor(p) => &p.parameters,
            Property::ForeignKey(p) => &p.parameters,
        }
    }

    /// Columns this property reads. For derived properties this is the union
    /// of their column parameters, in parameter order.
    pub fn columns(&self) -> Vec<Column> {
        match self {
            Property::Default(p) => vec![p.column.clone()],
            _ => self
                .parameters()
                .iter()
                .filter_map(|p| match p {
                    Parameter::Column { column, .. } => Some(column.clone()),
                    _ => None,
                })
                .unique()
                .collect(),
        }
    }
}

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{CacheError, Result};
use crate::model::{
    Column, DataLevel, DataType, DefaultProperty, Key, Property, Row, TypeName,
};

/// How strongly a factory's stores hold on to cached beans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReferenceType {
    Strong,
    Soft,
    Weak,
}

impl FromStr for ReferenceType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRONG" => Ok(ReferenceType::Strong),
            "SOFT" => Ok(ReferenceType::Soft),
            "WEAK" => Ok(ReferenceType::Weak),
            _ => Err(CacheError::InvalidReferenceType(s.to_string())),
        }
    }
}

impl TryFrom<String> for ReferenceType {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ReferenceType> for String {
    fn from(value: ReferenceType) -> Self {
        match value {
            ReferenceType::Strong => "STRONG",
            ReferenceType::Soft => "SOFT",
            ReferenceType::Weak => "WEAK",
        }
        .to_string()
    }
}

/// Named secondary key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<Column>,
}

impl IndexDef {
    pub fn new(name: &str, unique: bool, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            unique,
            columns: columns.iter().map(Column::new).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SubClassOperator {
    Eq,
    NotEq,
    In,
    NotIn,
}

impl FromStr for SubClassOperator {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().join(" ").to_ascii_uppercase();
        match normalized.as_str() {
            "=" | "==" => Ok(SubClassOperator::Eq),
            "!=" | "<>" => Ok(SubClassOperator::NotEq),
            "IN" => Ok(SubClassOperator::In),
            "NOT IN" => Ok(SubClassOperator::NotIn),
            _ => Err(CacheError::InvalidOperator(s.to_string())),
        }
    }
}

impl TryFrom<String> for SubClassOperator {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SubClassOperator> for String {
    fn from(value: SubClassOperator) -> Self {
        match value {
            SubClassOperator::Eq => "=",
            SubClassOperator::NotEq => "!=",
            SubClassOperator::In => "IN",
            SubClassOperator::NotIn => "NOT IN",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubClassCriterion {
    pub column: Column,
    pub operator: SubClassOperator,
    pub values: Vec<String>,
}

impl SubClassCriterion {
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.value(&self.column).and_then(|v| v.to_text());
        let contained = match &actual {
            Some(actual) => self.values.iter().any(|v| v == actual),
            None => false,
        };
        match self.operator {
            SubClassOperator::Eq | SubClassOperator::In => contained,
            SubClassOperator::NotEq | SubClassOperator::NotIn => !contained,
        }
    }
}

/// Rule mapping rows to a concrete sub-type. Every criterion must match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubClassMapping {
    pub criteria: Vec<SubClassCriterion>,
    pub sub_class: TypeName,
}

impl SubClassMapping {
    pub fn new(sub_class: &str) -> Self {
        Self {
            criteria: Vec::new(),
            sub_class: sub_class.to_string(),
        }
    }

    pub fn when(mut self, column: &str, operator: SubClassOperator, values: &[&str]) -> Self {
        self.criteria.push(SubClassCriterion {
            column: Column::new(column),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.criteria.iter().all(|c| c.matches(row))
    }
}

fn default_reference_type() -> ReferenceType {
    ReferenceType::Strong
}

fn default_level() -> DataLevel {
    DataLevel::High
}

fn default_factory_type() -> String {
    "default".to_string()
}

fn default_indexable() -> bool {
    true
}

/// Metadata for one bean type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub type_name: TypeName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub super_type: Option<TypeName>,
    #[serde(default)]
    pub primary_key: Vec<Column>,
    #[serde(default)]
    pub indices: Vec<IndexDef>,
    #[serde(default)]
    pub properties: Vec<Property>,
    #[serde(default)]
    pub sub_class_mappings: Vec<SubClassMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_sub_class: Option<TypeName>,
    #[serde(default = "default_reference_type")]
    pub reference_type: ReferenceType,
    #[serde(default = "default_level")]
    pub data_volatility: DataLevel,
    #[serde(default = "default_level")]
    pub data_quantity: DataLevel,
    /// Kind of bean factory that caches this type
    #[serde(default = "default_factory_type")]
    pub bean_factory_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_data_source: Option<String>,
    /// Whether beans of this type track their one-to-many index membership
    #[serde(default = "default_indexable")]
    pub indexable: bool,
    /// Direct sub-types, sorted. Filled in when the registry is built.
    #[serde(skip)]
    pub(crate) sub_classes: Vec<TypeName>,
    /// Root of the type hierarchy, if this type has a super type
    #[serde(skip)]
    pub(crate) ancestor_type: Option<TypeName>,
}

impl Schema {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            super_type: None,
            primary_key: Vec::new(),
            indices: Vec::new(),
            properties: Vec::new(),
            sub_class_mappings: Vec::new(),
            default_sub_class: None,
            reference_type: ReferenceType::Strong,
            data_volatility: DataLevel::High,
            data_quantity: DataLevel::High,
            bean_factory_type: default_factory_type(),
            default_data_source: None,
            indexable: true,
            sub_classes: Vec::new(),
            ancestor_type: None,
        }
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(Column::new).collect();
        self
    }

    pub fn with_super_type(mut self, super_type: &str) -> Self {
        self.super_type = Some(super_type.to_string());
        self
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indices.push(index);
        self
    }

    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_column(self, name: &str, column: &str, data_type: DataType) -> Self {
        self.with_property(Property::default_property(name, column, Some(data_type)))
    }

    pub fn with_sub_class_mapping(mut self, mapping: SubClassMapping) -> Self {
        self.sub_class_mappings.push(mapping);
        self
    }

    pub fn with_default_sub_class(mut self, sub_class: &str) -> Self {
        self.default_sub_class = Some(sub_class.to_string());
        self
    }

    pub fn with_reference_type(mut self, reference_type: ReferenceType) -> Self {
        self.reference_type = reference_type;
        self
    }

    pub fn with_levels(mut self, volatility: DataLevel, quantity: DataLevel) -> Self {
        self.data_volatility = volatility;
        self.data_quantity = quantity;
        self
    }

    pub fn with_factory_type(mut self, bean_factory_type: &str) -> Self {
        self.bean_factory_type = bean_factory_type.to_string();
        self
    }

    pub fn with_data_source(mut self, data_source: &str) -> Self {
        self.default_data_source = Some(data_source.to_string());
        self
    }

    pub fn super_type(&self) -> Option<&str> {
        self.super_type.as_deref()
    }

    pub fn ancestor_type(&self) -> Option<&str> {
        self.ancestor_type.as_deref()
    }

    /// Type whose lock guards this whole hierarchy
    pub fn hierarchy_root(&self) -> &str {
        self.ancestor_type().unwrap_or(&self.type_name)
    }

    pub fn sub_classes(&self) -> &[TypeName] {
        &self.sub_classes
    }

    pub fn has_sub_classes(&self) -> bool {
        !self.sub_classes.is_empty()
    }

    pub fn primary_key(&self) -> Result<&[Column]> {
        if self.primary_key.is_empty() {
            return Err(CacheError::MissingPrimaryKey(self.type_name.clone()));
        }
        Ok(&self.primary_key)
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indices.iter().find(|i| i.name == name)
    }

    /// Columns making up the key of the primary store or the named index
    pub fn key_columns(&self, index: Option<&str>) -> Result<Vec<Column>> {
        match index {
            None => Ok(self.primary_key()?.to_vec()),
            Some(name) => self
                .index(name)
                .map(|i| i.columns.clone())
                .ok_or_else(|| CacheError::MissingIndex {
                    type_name: self.type_name.clone(),
                    index: name.to_string(),
                }),
        }
    }

    /// Primary key plus every index column, without duplicates, in order
    pub fn union_of_key_columns(&self) -> Vec<Column> {
        self.primary_key
            .iter()
            .chain(self.indices.iter().flat_map(|i| i.columns.iter()))
            .unique()
            .cloned()
            .collect()
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name() == name)
    }

    pub fn derived_properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter().filter(|p| p.is_derived())
    }

    pub fn default_property_for_column(&self, column: &Column) -> Option<&DefaultProperty> {
        self.properties.iter().find_map(|p| match p {
            Property::Default(d) if &d.column == column => Some(d),
            _ => None,
        })
    }

    /// Every property reading the given column
    pub fn properties_for_column(&self, column: &Column) -> Vec<&Property> {
        self.properties
            .iter()
            .filter(|p| p.columns().contains(column))
            .collect()
    }

    /// Union of the columns read by derived properties. These are the column
    /// values saved during the first pass.
    pub fn derived_property_columns(&self) -> Vec<Column> {
        self.derived_properties()
            .flat_map(|p| p.columns())
            .unique()
            .collect()
    }

    /// Declared type of a column, taken from the default property bound to it
    pub fn column_type(&self, column: &Column) -> Option<DataType> {
        self.default_property_for_column(column)
            .and_then(|p| p.data_type)
    }

    /// Coerce the components of a key to the types of the given columns
    pub fn change_key_type(&self, key: &Key, columns: &[Column]) -> Key {
        let types = columns.iter().map(|c| self.column_type(c)).collect::<Vec<_>>();
        key.coerce(&types)
    }

    pub fn is_low_quantity_and_volatility(&self) -> bool {
        self.data_quantity == DataLevel::Low && self.data_volatility == DataLevel::Low
    }

    /// Concrete type for a row: the first matching mapping rule, then the
    /// default sub-class, then this type
    pub fn sub_class_for_row(&self, row: &Row) -> TypeName {
        self.sub_class_mappings
            .iter()
            .find(|m| m.matches(row))
            .map(|m| m.sub_class.clone())
            .or_else(|| self.default_sub_class.clone())
            .unwrap_or_else(|| self.type_name.clone())
    }
}

/// Build the key for a row from the given columns, coercing to column types.
/// `None` if any component is null.
pub fn key_from_row(schema: &Schema, row: &Row, columns: &[Column]) -> Option<Key> {
    let values = columns
        .iter()
        .map(|c| row.value_as(c, schema.column_type(c)))
        .collect::<Vec<_>>();
    Key::from_values(&values)
}

pub(crate) fn merge_properties(inherited: &[Property], own: &[Property]) -> Vec<Property> {
    let own_names: HashMap<&str, ()> = own.iter().map(|p| (p.name(), ())).collect();
    inherited
        .iter()
        .filter(|p| !own_names.contains_key(p.name()))
        .chain(own.iter())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RowKind, Value};
    use std::sync::Arc;

    fn row(columns: &[&str], values: Vec<Value>) -> Row {
        Row::new(
            RowKind::Select,
            Arc::new(columns.iter().map(Column::new).collect()),
            values,
        )
    }

    fn instrument() -> Schema {
        Schema::new("Instrument")
            .with_primary_key(&["INSTRUMENT_ID"])
            .with_column("instrumentId", "INSTRUMENT_ID", DataType::Integer)
            .with_column("type", "INSTRUMENT_TYPE", DataType::String)
            .with_index(IndexDef::new("byCode", true, &["CODE"]))
            .with_index(IndexDef::new("byIssuer", false, &["ISSUER_ID", "INSTRUMENT_ID"]))
            .with_sub_class_mapping(
                SubClassMapping::new("Bond").when(
                    "INSTRUMENT_TYPE",
                    SubClassOperator::Eq,
                    &["BOND"],
                ),
            )
            .with_sub_class_mapping(
                SubClassMapping::new("Future")
                    .when("INSTRUMENT_TYPE", SubClassOperator::In, &["FUT", "FUTURE"])
                    .when("EXCHANGE", SubClassOperator::NotEq, &["OTC"]),
            )
    }

    #[test]
    fn test_reference_type_parsing() {
        assert_eq!("soft".parse::<ReferenceType>().unwrap(), ReferenceType::Soft);
        assert!(matches!(
            "squishy".parse::<ReferenceType>(),
            Err(CacheError::InvalidReferenceType(_))
        ));
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("<>".parse::<SubClassOperator>().unwrap(), SubClassOperator::NotEq);
        assert_eq!("not  in".parse::<SubClassOperator>().unwrap(), SubClassOperator::NotIn);
        assert!("LIKE".parse::<SubClassOperator>().is_err());
    }

    #[test]
    fn test_sub_class_dispatch() {
        let schema = instrument();
        let columns = ["INSTRUMENT_ID", "INSTRUMENT_TYPE", "EXCHANGE"];

        let bond = row(&columns, vec![1.into(), "BOND".into(), "LSE".into()]);
        assert_eq!(schema.sub_class_for_row(&bond), "Bond");

        let future = row(&columns, vec![2.into(), "FUT".into(), "LIFFE".into()]);
        assert_eq!(schema.sub_class_for_row(&future), "Future");

        // All criteria must match
        let otc = row(&columns, vec![3.into(), "FUT".into(), "OTC".into()]);
        assert_eq!(schema.sub_class_for_row(&otc), "Instrument");

        let fallback = instrument().with_default_sub_class("Equity");
        assert_eq!(fallback.sub_class_for_row(&otc), "Equity");
    }

    #[test]
    fn test_union_of_key_columns() {
        let schema = instrument();
        assert_eq!(
            schema.union_of_key_columns(),
            vec![
                Column::new("INSTRUMENT_ID"),
                Column::new("CODE"),
                Column::new("ISSUER_ID")
            ]
        );
    }

    #[test]
    fn test_key_columns_and_missing_index() {
        let schema = instrument();
        assert_eq!(schema.key_columns(None).unwrap().len(), 1);
        assert_eq!(schema.key_columns(Some("byIssuer")).unwrap().len(), 2);
        assert!(matches!(
            schema.key_columns(Some("byNothing")),
            Err(CacheError::MissingIndex { .. })
        ));
        assert!(Schema::new("Empty").primary_key().is_err());
    }

    #[test]
    fn test_key_from_row_uses_column_types() {
        let schema = instrument();
        let row = row(&["INSTRUMENT_ID"], vec!["17".into()]);
        let key = key_from_row(&schema, &row, &[Column::new("INSTRUMENT_ID")]);
        assert_eq!(key, Some(Key::from(17)));
        assert_eq!(
            schema.change_key_type(&Key::from("17"), &[Column::new("INSTRUMENT_ID")]),
            Key::from(17)
        );
    }

    #[test]
    fn test_schema_from_json() {
        let json = r#"{
            "type_name": "Currency",
            "primary_key": ["CODE"],
            "reference_type": "weak",
            "data_volatility": "LOW",
            "data_quantity": "LOW",
            "properties": [{"kind": "default", "name": "code", "column": "CODE"}]
        }"#;
        let schema: Schema = serde_json::from_str(json).unwrap();
        assert_eq!(schema.reference_type, ReferenceType::Weak);
        assert!(schema.is_low_quantity_and_volatility());

        let bad = json.replace("weak", "brittle");
        assert!(serde_json::from_str::<Schema>(&bad).is_err());
    }
}

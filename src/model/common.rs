use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a bean type as registered with the schema registry
pub type TypeName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DataType {
    String,
    Integer,
    Number,
    Boolean,
    Timestamp,
    Object,
}

/// HIGH/LOW classification used for both data volatility and data quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataLevel {
    Low,
    High,
}

impl std::str::FromStr for DataLevel {
    type Err = crate::CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(DataLevel::Low),
            "HIGH" => Ok(DataLevel::High),
            _ => Err(crate::CacheError::InvalidLevel(s.to_string())),
        }
    }
}

/// Identity of one cache: a bean type within a data source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactoryKey {
    pub type_name: TypeName,
    pub data_source: String,
}

impl FactoryKey {
    pub fn new(type_name: impl Into<TypeName>, data_source: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            data_source: data_source.into(),
        }
    }
}

impl fmt::Display for FactoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.type_name, self.data_source)
    }
}

pub mod bean;
pub mod collection;
pub mod common;
pub mod criterion;
pub mod event;
pub mod key;
pub mod property;
pub mod row;
pub mod schema;
pub mod schema_registry;
pub mod value;

pub use bean::*;
pub use collection::*;
pub use common::*;
pub use criterion::*;
pub use event::*;
pub use key::*;
pub use property::*;
pub use row::*;
pub use schema::*;
pub use schema_registry::*;
pub use value::*;

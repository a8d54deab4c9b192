pub mod criteria_collection;
pub mod events;
pub mod factory;
pub mod factory_type;
pub mod inflation;
pub mod load;
pub mod notifications;
pub(crate) mod properties;
pub mod registry;
pub mod tabular;
pub(crate) mod transformer;

pub use criteria_collection::*;
pub use events::*;
pub use factory::*;
pub use factory_type::*;
pub use inflation::*;
pub use load::*;
pub use notifications::*;
pub use registry::*;
pub use tabular::*;
pub(crate) use transformer::{inflate_rows, load_tabular_data};

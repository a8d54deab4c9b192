pub mod association;
pub mod indexed;
pub mod traits;

pub use association::*;
pub use indexed::*;
pub use traits::*;

//! In-memory object model: handles and attribute values.

mod handle;
mod value;

pub use handle::ObjectHandle;
pub(crate) use handle::{CellSnapshot, HandleKey};
pub use value::{Attributes, Decimal, Record, Value};

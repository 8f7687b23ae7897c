//! Transaction coordination.

mod datamanager;
mod state;

pub use datamanager::DataManager;
pub use state::{Savepoint, TxnStatus};

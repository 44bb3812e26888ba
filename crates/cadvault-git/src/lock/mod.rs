mod store;

pub use store::{LockStore, UNKNOWN_OWNER};

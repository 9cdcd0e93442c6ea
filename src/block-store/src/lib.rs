mod store;

pub use store::{BlockEntry, BlockStore};

mod collate;
pub mod dataset;
pub mod loader;
pub mod random;

pub use dataset::{Batch, Dataset};
pub use loader::DataLoader;
pub use random::RandomDataset;

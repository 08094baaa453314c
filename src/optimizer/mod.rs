pub mod adamw;
pub mod grad_accumulator;
pub mod grad_clip;
pub mod grad_scaler;

pub use adamw::{AdamW, AdamWConfig};
pub use grad_accumulator::{GradAccumulator, accumulate_into};
pub use grad_clip::{clip_coefficient, clip_grad_norm, global_norm, squared_norm};
pub use grad_scaler::GradScaler;

pub mod amp;
pub mod backend;
pub mod config;
pub mod reference;

pub use amp::AmpPolicy;
pub use backend::{TrainingBackend, TrainingSession};
pub use config::{
    ConfigurationBuilder, ConfigurationSpec, LossScaleStrategy, ParallelStrategy, PrecisionMode,
    TrainingConfig, TrainingConfiguration,
};
pub use reference::{DeviceCapabilities, ReferenceBackend, ReferenceSession};

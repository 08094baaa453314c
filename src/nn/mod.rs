pub mod layout;
pub mod linear;
pub mod mlp;
pub mod snapshot;

pub use layout::{ParamEntry, ParamLayout};
pub use linear::Linear;
pub use mlp::{ForwardPass, Mlp, MlpConfig};
pub use snapshot::{ModelSnapshot, NamedTensor};

//! AICF configuration: the `AicfConfig` model, JSON5 parsing and the
//! system/user/project/runtime layer stack.

mod error;
mod loader;
mod model;

pub use error::ConfigError;
pub use loader::{ConfigLayer, ConfigLayerSource, LayeredConfig, LayeredConfigOptions};
pub use model::*;

pub mod augment;
pub mod config;
pub mod dataset;
pub mod error;
pub mod labels;
pub mod model;
pub mod overlay;
#[cfg(feature = "torch")]
pub mod torch;
pub mod transforms;

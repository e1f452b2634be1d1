#[cfg(feature = "pretrained")]
mod download;
#[cfg(feature = "pretrained")]
pub(crate) use download::download;

pub mod deeplab;
pub mod registry;
pub mod resnet;
pub mod state;
pub mod stem;

mod constructor;
pub use constructor::*;

mod error;
pub use error::*;

mod ffn;
pub use ffn::*;

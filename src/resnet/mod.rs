mod block;
mod presets;
mod resnet;

pub use block::*;
pub use presets::*;
pub use resnet::*;

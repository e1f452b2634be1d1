mod aspp;
mod conv_bn_relu;
mod head;
mod model;

pub use aspp::*;
pub use conv_bn_relu::*;
pub use head::*;
pub use model::*;

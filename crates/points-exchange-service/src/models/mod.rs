//! 积分兑换领域模型

mod account;
mod enums;
mod linkage;
mod reconciliation;

pub use account::*;
pub use enums::*;
pub use linkage::*;
pub use reconciliation::*;

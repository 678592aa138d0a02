pub mod endpoint;
pub mod stats;

pub use endpoint::*;
pub use stats::*;

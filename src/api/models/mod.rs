pub mod bus;
pub mod plugins;

pub use bus::*;
pub use plugins::*;

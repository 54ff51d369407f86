mod store;
mod ownership;
mod file_meta;
mod nodes;
mod config;

pub use store::*;
pub use ownership::*;
pub use file_meta::*;
pub use nodes::*;
pub use config::*;

#[macro_use]
extern crate log;

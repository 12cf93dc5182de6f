pub mod config;
pub mod error;
pub mod packet;
pub mod wire;

pub use config::*;
pub use error::*;
pub use packet::*;
pub use wire::*;

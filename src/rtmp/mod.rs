// RTMP protocol utilities

mod chunk;
mod command;
mod constants;
mod handshake;
mod metadata;
mod packer;

pub use chunk::*;
pub use command::*;
pub use constants::*;
pub use handshake::*;
pub use metadata::*;
pub use packer::*;

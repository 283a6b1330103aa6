// RTP payload formats

mod av_packet;
mod packer;
mod packet;
mod unpacker;

pub use av_packet::*;
pub use packer::*;
pub use packet::*;
pub use unpacker::*;

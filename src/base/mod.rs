// Base types shared by every layer

mod av_msg;
mod av_packet;
mod clock;
mod error;
mod stat;

pub use av_msg::*;
pub use av_packet::*;
pub use clock::*;
pub use error::*;
pub use stat::*;

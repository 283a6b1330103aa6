// RTSP sessions

mod message;
mod server;

pub use message::*;
pub use server::*;

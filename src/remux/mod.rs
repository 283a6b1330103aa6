// Container remuxing

mod dummy_audio;
mod flv;
mod lazy;
mod mpegts;
pub mod rtp;
mod sdp;

pub use dummy_audio::*;
pub use flv::*;
pub use lazy::*;
pub use mpegts::*;
pub use sdp::*;

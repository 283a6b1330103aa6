// Stream groups

mod codec_context;
mod config;
mod gop_cache;
#[allow(clippy::module_inception)]
mod group;
mod manager;
mod subscriber;

pub use codec_context::*;
pub use config::*;
pub use gop_cache::*;
pub use group::*;
pub use manager::*;
pub use subscriber::*;

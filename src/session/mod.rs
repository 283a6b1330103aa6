// Sessions

mod customize_pub;
mod handle;
mod http_sub;
mod rtmp_client;
mod rtmp_server;
mod rtsp;
mod write;

pub use customize_pub::*;
pub use handle::*;
pub use http_sub::*;
pub use rtmp_client::*;
pub use rtmp_server::*;
pub use rtsp::*;
pub use write::*;

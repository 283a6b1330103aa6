// Server: listeners, group registry and admin actions

mod auth;
mod config;
mod context;
mod ip_blacklist;
mod manager;
mod session_id_generator;
mod tcp;

pub use auth::*;
pub use config::*;
pub use context::*;
pub use ip_blacklist::*;
pub use manager::*;
pub use session_id_generator::*;
pub use tcp::*;

// Observer hooks and the HTTP callback observer

mod config;
mod event;
mod observer;
mod request;
mod token;

pub use config::*;
pub use event::*;
pub use observer::*;
pub use request::*;
pub use token::*;

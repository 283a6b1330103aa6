// Utils module

mod env;
mod query_string;
mod string_compare_secure;

pub use env::*;
pub use query_string::*;
pub use string_compare_secure::*;

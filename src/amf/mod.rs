// AMF0 parser and serializer

mod amf0;
mod decode;

pub use amf0::*;
pub use decode::*;

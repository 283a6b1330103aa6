// Codec bitstream helpers

mod aac;
mod avc;
mod bits;
mod hevc;
mod nalu;

pub use aac::*;
pub use avc::*;
pub use bits::*;
pub use hevc::*;
pub use nalu::*;

#[cfg(test)]
pub(crate) use avc::test_util as avc_test_util;
#[cfg(test)]
pub(crate) use hevc::test_util as hevc_test_util;

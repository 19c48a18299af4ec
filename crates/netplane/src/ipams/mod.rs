//! Address managers shipped with netplane.

pub mod builtin;
pub mod null;

pub use builtin::BuiltinIpam;
pub use null::NullIpam;

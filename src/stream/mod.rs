pub mod format;
pub mod listener;
pub mod registry;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use format::*;
pub use listener::*;
pub use registry::*;
pub use source::*;

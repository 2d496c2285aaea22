//! Tether utilities

#[cfg(feature = "injector")]
pub mod injector;

#[cfg(feature = "interceptor")]
pub mod interceptor;

mod hexdump;
pub use self::hexdump::{Representation, hexdump};

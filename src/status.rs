//! Status codes produced by this crate itself.
//!
//! Handler-supplied codes are passed through unmodified; only `OK` carries
//! meaning to the exchange layer.

pub const OK: i32 = 0;
pub const UNKNOWN: i32 = 2;
pub const INTERNAL: i32 = 13;
pub const UNAVAILABLE: i32 = 14;

pub const OK_MESSAGE: &str = "OK";

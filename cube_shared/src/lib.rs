//! `cube_shared`
//!
//! Shared libraries used by both the client and the reference server.
//!
//! - `math`: vectors and colors carried by snapshots.
//! - `net`: message types, two-pass JSON codec, stream framing.
//! - `config`: JSON configuration with defaults.

pub mod config;
pub mod math;
pub mod net;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::math::*;
    pub use crate::net::*;
}

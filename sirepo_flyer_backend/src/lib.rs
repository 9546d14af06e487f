//! Flyers over Sirepo simulations, built on `sirepo_backend`.
//!
//! - [`SirepoFlyer`]: runs one simulation copy per parameter delta, serially or on worker
//!   threads, and collects one row per copy.
//! - [`MadxFlyer`]: runs a single job with a tabular result and collects one row per table row.
//!
//! Both implement the [`BlueskyFlyer`] lifecycle.

pub mod flyer;
pub mod madx_flyer;
pub mod sirepo_flyer;
pub mod utils;
pub mod worker;

pub use crate::flyer::*;
pub use crate::madx_flyer::*;
pub use crate::sirepo_flyer::*;
pub use crate::utils::*;
pub use crate::worker::*;

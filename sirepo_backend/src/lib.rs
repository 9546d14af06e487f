//! Exposes Sirepo beamline simulations as experiment-control devices.
//!
//! A [`SirepoClient`] logs in to the simulation service and owns the simulation document. The
//! synthesis engine ([`create_classes`]) turns every element of that document into a [`Device`]
//! whose signals read and write the document in place, and a [`Beamline`] registry addresses the
//! devices by name for the scheduler. Watchpoints and spectrum reports run the simulation on
//! trigger and publish the parsed result.

pub mod asset;
pub mod beamline;
pub mod client;
pub mod config;
pub mod device;
pub mod document;
pub mod error;
#[cfg(feature = "python")]
pub mod python;
pub mod reader;
pub mod report;
pub mod signal;
pub mod sim;
pub mod synthesis;
pub mod transport;
pub mod utils;

pub use indexmap;

pub use asset::*;
pub use beamline::*;
pub use client::*;
pub use config::*;
pub use device::*;
pub use document::*;
pub use error::*;
pub use reader::*;
pub use report::*;
pub use signal::*;
pub use sim::*;
pub use synthesis::*;
pub use transport::*;
pub use utils::*;

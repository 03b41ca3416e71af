//! Lennard-Jones molecular dynamics with velocity Verlet integration. Force evaluation is split
//! across one or more compute devices by contiguous atom ranges; the fragments are merged on the
//! host after every force pass.

pub mod args;
pub mod buffers;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
#[cfg(feature = "cuda")]
pub mod gpu;
pub mod host;
pub mod kernels;
pub mod lattice;
pub mod merge;
pub mod output;
pub mod partition;
pub mod pipeline;
pub mod program;
pub mod reference;
pub mod restart;
pub mod state;
pub mod units;
pub mod util;

pub use error::{LjmdError, LjmdResult};
pub use pipeline::{RunOptions, Simulation};
pub use state::SimulationState;

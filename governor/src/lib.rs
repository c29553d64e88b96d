//! Governor runtime library.
//!
//! The Governor keeps a set of physical positioners (motors, valves and
//! placeholders) inside a shared motion envelope by only ever moving them
//! through pre-declared, staged transitions between named states. The
//! control surface is a set of named channels following the `{Gov...}`
//! naming convention; operators drive it by writing to a handful of
//! command channels.
//!
//! # Module Structure
//!
//! - [`device`] - Device drivers over the narrow channel-access seam
//! - [`target`] - Target setpoint store with cross-machine sync
//! - [`machine`] - Compiled machines: states, transitions, reachability
//! - [`executor`] - The staged transition executor
//! - [`controller`] - Per-machine command serializer and status owner
//! - [`supervisor`] - The Governor: machine selection, abort, kill
//! - [`pv`] - Channel naming, registry and write routing

pub mod controller;
pub mod device;
pub mod executor;
pub mod machine;
pub mod pv;
pub mod supervisor;
pub mod target;

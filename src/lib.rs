//! Hierarchical trees of named objects carrying state machines, with
//! transitions wired across the tree and committed through external
//! effectors in two phases.
//!
//! A [`System`] owns a tree of objects; machines registered on it hold a
//! fixed, lowercase label set and a current label. Wiring chains machines
//! together ("when `conn` enters `online`, move `door` to `open`"), and
//! every transition runs a lock → change → release protocol over the
//! machine's bound [`Output`] handlers, so a GPIO pin or an actuator can
//! veto or enact the physical change before the logical one is recorded.
//! Handlers that need cooperative suspension implement [`AsyncOutput`]
//! instead; a synchronous [`System::transition`] call refuses up front if
//! its reachable wiring closure contains one.
//!
//! ```
//! use statewire::System;
//!
//! # fn main() -> statewire::Result<()> {
//! let mut sys = System::new("iot");
//! let conn = sys.add_machine(sys.root(), "conn", &["offline", "online"], None)?;
//! let door = sys.add_machine(sys.root(), "door", &["closed", "open"], Some("closed"))?;
//!
//! let online = sys.handle(conn, "online")?;
//! sys.wire(door, "open", &[online])?;
//!
//! sys.transition(conn, "online")?;
//! assert!(sys.query(door, "open")?);
//! assert_eq!(sys.to_string(), "<iot conn=[offline, ONLINE] door=[closed, OPEN]>");
//! # Ok(())
//! # }
//! ```
//!
//! Trees can also be assembled from a YAML or JSON record through
//! [`loader::Registry`].

pub mod error;
pub mod loader;
pub mod output;
pub mod tree;
pub mod types;

mod engine;

pub use error::{Error, Result};
pub use loader::{Registry, SystemConfig};
pub use output::{AsyncOutput, Output, OutputBinding};
pub use tree::System;
pub use types::{Condition, GateId, Handle, InitHook, MachineId, NodeId};

//! Capability implementations.
//!
//! The engine only ever talks to a `StageCapability` / `AlignmentCapability`
//! trait object; this module holds the production implementation that
//! shells out to an external agent CLI. Tests use in-memory mocks instead.

pub mod process;

pub use process::ProcessCapability;

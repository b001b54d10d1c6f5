//! Lumen VM Optimizing Specializer
//!
//! The specializer ("spesh") is the optimizing tier of the Lumen
//! dynamic-language virtual machine. Earlier tiers record per-frame type
//! and concreteness facts while interpreting; once a frame is hot, it is
//! translated into a per-frame SSA control-flow graph and run through the
//! optimization passes in this crate.
//!
//! ## Compilation Pipeline
//!
//! ```text
//! Frame bytecode
//!       │
//!       ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Facts/Guard │────▶│  SSA Graph  │────▶│ Escape/PEA  │────▶│  Code Gen   │
//! │ Collection  │     │ (per frame) │     │  (this)     │     │ (back-end)  │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!                                                │
//!                                                ▼
//!                                         ┌─────────────┐
//!                                         │ Deopt Side  │
//!                                         │   Tables    │
//!                                         └─────────────┘
//! ```
//!
//! The centerpiece is the partial escape analysis and scalar replacement
//! pass in [`spesh::pea`]: it removes short-lived heap allocations whose
//! identity never becomes observable outside the frame, spreads their
//! attributes into fresh SSA registers, and plans materializations that
//! rebuild a real object at the last possible moment when deoptimization
//! or an unavoidable escape demands one.

pub mod spesh;

pub use spesh::{SpeshError, SpeshResult};

/// Specializer version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Platform name
pub const PLATFORM_NAME: &str = "Lumen Virtual Machine";

// ── In-memory collaborators ──
//
// Deterministic state store and provider used by the simulator and by
// tests. No I/O, no clocks.

mod provider;
mod state;

pub use provider::{MemoryEnviron, MemoryProvider, Operation, PortCall, PortOp, PortScope};
pub use state::MemoryState;

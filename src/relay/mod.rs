//! Call relay: the per-call state machine and the outbound audio peer link.

pub mod peer;
pub mod session;

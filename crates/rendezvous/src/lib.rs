//! Rendezvous - Wait for every host of a distributed run to be reachable
//!
//! Hosts are probed on a fixed interval within an overall deadline. The
//! coordinator moves from `Waiting` to `Ready` once every host answered,
//! or to `TimedOut` at the deadline, naming the hosts that never did.

mod coordinator;
mod poll;
mod probe;

pub use coordinator::{RendezvousCoordinator, RendezvousOutcome, RendezvousPhase, RendezvousState};
pub use poll::TimedPoll;
pub use probe::{probe_for_mode, ConnectProbe, HostProbe, ResolveProbe};

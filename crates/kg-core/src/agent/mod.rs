//! Key-serving endpoint discovery, linking and supervision.

pub mod endpoint;
pub mod locator;
pub mod process;
pub mod protocol;
pub mod supervisor;

pub use endpoint::{AgentEndpoint, CanonicalLink, EndpointKind};
pub use locator::{Candidate, Located, SocketLocator};
pub use process::{ManagedProcess, ManagedRecord, SpawnLock};
pub use supervisor::{
    AgentControl, AgentSupervisor, CallerMode, SupervisorPaths, SupervisorState, SupervisorTimings,
};

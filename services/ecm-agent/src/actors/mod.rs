//! Actor framework for the ECM agent.
//!
//! ## Design Principles
//!
//! - **Single owner**: the coordinator actor owns the operation table and the
//!   plugin store; nothing else touches them
//! - **Message passing**: session tasks reach the coordinator only through its
//!   mailbox
//! - **Watched children**: the supervisor ticks the coordinator and fails the
//!   agent if it exits
//!
//! ## Actor Types
//!
//! - `CoordinatorActor`: routes commands and acknowledgments
//! - `EcmSupervisor`: root supervisor, tick loop and shutdown

mod coordinator;
mod framework;
mod supervisor;

pub use coordinator::{CoordinatorActor, CoordinatorHandle, CoordinatorMessage};
pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, ActorRef, ActorState, BackoffPolicy, Message,
    Supervisor,
};
pub use supervisor::EcmSupervisor;

//! Gateway to the external agent decision service.
//!
//! The engine treats agent-controlled seats as remote decision makers
//! behind an HTTP API: register on startup, ask for an action when it's
//! their turn or a vote is open, push chat and state notifications, and
//! tear down on game end. This crate owns that plumbing — bounded
//! retries, pacing jitter, and the JSON payload shapes — behind the
//! [`DecisionService`] trait so the engine and its tests never depend
//! on a live service.

mod error;
mod service;
mod types;

pub use error::GatewayError;
pub use service::{DEFAULT_SERVICE_URL, DecisionService, HttpDecisionService};
pub use types::{
    Ack, ActionData, ActionRequest, ActionResponse, AgentTask, PrivateData, StartupRequest,
    StartupResponse, StateUpdate,
};

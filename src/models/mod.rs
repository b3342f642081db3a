//! Core data model for the streaming middleware
//!
//! Sessions, transcode profiles, exit statuses, and the capability/decision
//! types. These are plain data carriers; behavior lives in the subsystem
//! modules that own them.

pub mod decision;
pub mod profile;
pub mod session;

pub use decision::{
    CapabilityProfile, Decision, DecisionMode, DecisionPolicy, Protocol, SourceProbe, reasons,
};
pub use profile::ProfileSpec;
pub use session::{ExitReason, ExitStatus, SessionRecord, SessionSnapshot, SessionState};

//! # Control Module
//!
//! Network surfaces used by the local web application and the site tools.
//!
//! - [`command`]: line-oriented TCP command socket (`CALL`, `DATA`, `KILL`)
//! - [`discovery`]: UDP broadcast responder (`SENDID:<ip>`)

pub mod command;
pub mod discovery;

pub use command::{Command, CommandHandler};
pub use discovery::DiscoveryResponder;

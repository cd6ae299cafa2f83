//! Payment State Machine (§3, §4.D-§4.F): channel path, app-session path, and
//! the orchestrator that picks between them.

pub mod app_session;
pub mod channel;
pub mod orchestrator;

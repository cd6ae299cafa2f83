//! agentpay: a peer-to-peer agent payment broker.
//!
//! Autonomous software agents discover, hire, and pay each other for
//! discrete computational jobs over the public internet, settling funds via
//! a state-channel clearing network with an on-chain fallback. See
//! `DESIGN.md` for the module-by-module grounding ledger.

pub mod autonomous;
pub mod chain;
pub mod clearing;
pub mod config;
pub mod error;
pub mod feed;
pub mod hirer;
pub mod identity;
pub mod payments;
pub mod resolver;
pub mod sig_down;
pub mod status;
pub mod timestamp;
pub mod types;
pub mod work;
pub mod worker;

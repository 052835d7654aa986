//! Turium: block execution across frames and sandboxes
//!
//! Resolves selector chains through nested frames, relays blocks into frames that
//! are only reachable through messages, evaluates element and code conditions, and
//! runs user code in isolated execution contexts with a request/response protocol.

pub mod block;
pub mod cli;
pub mod condition;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod dom;
pub mod error;
pub mod logging;
pub mod policy;
pub mod relay;
pub mod sandbox;
pub mod selector;
pub mod workflow;

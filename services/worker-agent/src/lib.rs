//! modelplane Worker Agent Library
//!
//! The worker agent runs on each inference node and manages the
//! lifecycle of model instances placed there by the control plane. It
//! subscribes to the instance event stream, launches and supervises
//! inference server processes, probes their readiness, and reports
//! state transitions back with partial updates.
//!
//! ## Architecture
//!
//! ```text
//! control plane ──watch stream──> Watcher ──events──> Coordinator
//!                                                        │
//!                             Sweeper ──restart/health───┤
//!                                                        ▼
//!                                              ServeRuntime (OS processes)
//! ```
//!
//! ## Modules
//!
//! - `coordinator`: the lifecycle state machine and local bookkeeping
//! - `gate`: the coordination gate deciding which events this worker acts on
//! - `runtime`: process spawning and supervision (host + mock)
//! - `client`: control plane API client and watch stream

pub mod backend;
pub mod client;
pub mod coordinator;
pub mod gate;
pub mod logdir;
pub mod patch;
pub mod ports;
pub mod probe;
pub mod restart;
pub mod runtime;
pub mod sweeper;
pub mod types;
pub mod watcher;

// Internal modules exposed for integration tests
pub mod config;

pub use coordinator::Coordinator;

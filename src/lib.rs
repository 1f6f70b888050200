//! Feature-wiring initializer for a modular backend: resolves service and
//! extension-point dependencies, detects illegal configurations, starts
//! everything in the correct partial order with maximum safe parallelism,
//! and drives startup/shutdown lifecycle transitions.
//!
//! The entry point is [`Initializer`]. Build one with [`Initializer::new`],
//! register [`Feature`]s with [`Initializer::add`], then run
//! [`Initializer::start`]. [`Initializer::stop`] tears it back down, and is
//! also what a process-signal handler calls outside test mode.

pub mod builtin;
pub mod catalog;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod options;
pub mod orchestrator;
pub mod process_host;
pub mod refs;
pub mod registry;

pub use catalog::{Feature, FeatureDiscovery, InitSpec, ModuleRegistration, PluginRegistration};
pub use error::{InitError, Result};
pub use lifecycle::Lifecycle;
pub use logger::{Logger, TracingLogger};
pub use options::InitializerOptions;
pub use orchestrator::Initializer;
pub use process_host::{NoopProcessHost, ProcessHost, RealProcessHost};
pub use refs::{DepRef, ExtRef, Scope, ServiceRef};
pub use registry::{ServiceFactory, ServiceRegistry};

pub use backend_init_graph::{Graph, Node};

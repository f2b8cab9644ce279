//! `loomnet`: a reusable multi-service TCP/UDP network runtime. An
//! application registers services by URL (`tcp://host:port`,
//! `udp://host:port`, `unix:///path/to.sock`), supplies a
//! [`handler::HandlerManager`] that mints an [`handler::EventHandler`] per
//! session, and calls [`module::NetworkModule::run`] to drive everything
//! until [`module::NetworkModule::shutdown`] is called.
//!
//! The runtime dispatches every TCP/UDP session through one of a small pool
//! of cooperative event loops (`loop_`), so handler callbacks for a given
//! session are always strictly ordered without needing a per-session lock.
//! Outbound dials (`connector`) are simpler: each gets its own reader task
//! and calls its handler directly.

pub mod addr;
pub mod config;
pub mod connector;
pub mod error;
pub mod group;
pub mod handler;
pub mod listener;
pub mod loop_;
pub mod module;
pub mod packet;
pub mod pump;
pub mod registry;
pub mod session;
pub mod tick;
pub mod timer;

pub use error::{Error, Result};
pub use handler::{Action, DetachedStream, EventHandler, HandlerManager, OpenOptions};
pub use module::{ModuleStatus, NetworkModule};
pub use session::Session;

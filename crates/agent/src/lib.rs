//! Repeater agent.
//!
//! A [`Repeater`] registers itself with the backend over the message bus,
//! reports its liveness with periodic status events, and executes the HTTP
//! and WebSocket requests the backend sends it through the runners of
//! `repeater-runner`. [`RepeaterFactory`] wires a repeater from a
//! [`RepeaterConfig`] and a broker transport.

pub mod config;
pub mod error;
pub mod factory;
pub mod handler;
pub mod repeater;

pub use config::RepeaterConfig;
pub use error::RepeaterError;
pub use factory::RepeaterFactory;
pub use handler::RequestExecutingHandler;
pub use repeater::{Repeater, RepeaterState};

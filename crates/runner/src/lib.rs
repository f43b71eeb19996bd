//! Request runners for the Repeater agent.
//!
//! A [`RequestRunner`] executes one target request over HTTP or WebSocket
//! and always produces a [`RequestExecutingResult`](repeater_protocol::RequestExecutingResult):
//! transport failures and timeouts become failure results with an
//! [`ErrorCode`](repeater_protocol::ErrorCode) instead of errors.

pub mod error;
pub mod http;
pub mod options;
mod proxy;
pub mod registry;
pub mod ws;

pub use error::RunnerError;
pub use http::HttpRequestRunner;
pub use options::RequestRunnerOptions;
pub use registry::{RequestRunner, RequestRunnerRegistry, RunnerFuture};
pub use ws::WsRequestRunner;

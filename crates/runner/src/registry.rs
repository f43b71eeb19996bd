use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use repeater_protocol::{Protocol, RequestExecutingEvent, RequestExecutingResult};

use crate::error::RunnerError;
use crate::http::HttpRequestRunner;
use crate::options::RequestRunnerOptions;
use crate::ws::WsRequestRunner;

/// A boxed future returned by [`RequestRunner::run`].
pub type RunnerFuture<'a> = Pin<Box<dyn Future<Output = RequestExecutingResult> + Send + 'a>>;

/// Executes one target request over a specific protocol.
///
/// `run` never fails: transport errors and timeouts come back as a failure
/// result so the caller always has something to reply with.
pub trait RequestRunner: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn run<'a>(&'a self, request: &'a RequestExecutingEvent) -> RunnerFuture<'a>;
}

/// Runners keyed by the protocol they serve.
#[derive(Default, Clone)]
pub struct RequestRunnerRegistry {
    runners: HashMap<Protocol, Arc<dyn RequestRunner>>,
}

impl RequestRunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the HTTP and WebSocket runners.
    pub fn with_defaults(options: RequestRunnerOptions) -> Result<Self, RunnerError> {
        let mut registry = Self::new();
        registry.register(Arc::new(HttpRequestRunner::new(options.clone())?));
        registry.register(Arc::new(WsRequestRunner::new(options)));
        Ok(registry)
    }

    /// Adds `runner`, replacing any runner for the same protocol.
    pub fn register(&mut self, runner: Arc<dyn RequestRunner>) {
        self.runners.insert(runner.protocol(), runner);
    }

    /// The runner for `protocol`. Callers decide how to report a miss.
    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn RequestRunner>> {
        self.runners.get(&protocol).cloned()
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.runners.keys().copied().collect();
        protocols.sort_by_key(|p| p.as_str());
        protocols
    }
}

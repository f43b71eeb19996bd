use repeater_bus::{HandlerFuture, ReplyHandler};
use repeater_protocol::{RequestExecutingEvent, RequestExecutingResult};
use repeater_runner::RequestRunnerRegistry;
use tracing::debug;

use crate::error::RepeaterError;

/// Runs requests the backend sends and replies with their results.
pub struct RequestExecutingHandler {
    runners: RequestRunnerRegistry,
}

impl RequestExecutingHandler {
    pub fn new(runners: RequestRunnerRegistry) -> Self {
        Self { runners }
    }
}

impl ReplyHandler<RequestExecutingEvent> for RequestExecutingHandler {
    type Reply = RequestExecutingResult;

    fn handle(&self, request: RequestExecutingEvent) -> HandlerFuture<'_, RequestExecutingResult> {
        Box::pin(async move {
            let runner = self
                .runners
                .get(request.protocol)
                .ok_or(RepeaterError::UnsupportedProtocol(request.protocol))?;

            debug!(
                protocol = %request.protocol,
                method = %request.method,
                url = %request.url,
                "executing request"
            );
            let result = runner.run(&request).await;
            debug!(
                protocol = %request.protocol,
                status_code = ?result.status_code,
                error_code = ?result.error_code,
                "request executed"
            );
            Ok(result)
        })
    }
}

//! Poll queries: one store read, verbatim reply.

use metrics::counter;
use tracing::{debug, warn};

use taskgate_core::{GatewayError, TaskId};

use crate::context::GatewayContext;
use crate::query::error_body;

/// A single-shot read of a task's current result.
pub struct PollQuery {
    id: u64,
    data_key: String,
}

impl PollQuery {
    /// Prepare a poll for `task`.
    #[must_use]
    pub fn new(ctx: &GatewayContext, task: &TaskId) -> Self {
        Self {
            id: ctx.next_query_id(),
            data_key: ctx.keyspace.data_key(task),
        }
    }

    /// Perform exactly one `get` and produce the response body.
    ///
    /// A present value is returned verbatim; the gateway never
    /// re-serializes stored envelopes. No bus interaction.
    pub async fn run(self, ctx: &GatewayContext) -> String {
        counter!(crate::metrics::POLL_QUERIES_TOTAL).increment(1);
        match ctx.kv.get(&self.data_key).await {
            Ok(Some(value)) => {
                debug!(query_id = self.id, key = %self.data_key, "poll served from store");
                value
            }
            Ok(None) => {
                debug!(query_id = self.id, key = %self.data_key, "poll found no stored task");
                error_body(&GatewayError::NotFound)
            }
            Err(e) => {
                warn!(query_id = self.id, key = %self.data_key, error = %e, "store read failed");
                error_body(&GatewayError::Backend(e.to_string()))
            }
        }
    }
}

use tracing::error;

use super::error::AccessError;

/// Where guards send failures they recover from locally.
pub trait ErrorReporter: Send + Sync {
    fn report_error(&self, context: &str, error: &AccessError);
}

/// Logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report_error(&self, context: &str, error: &AccessError) {
        error!(context, error = %error, "access guard error");
    }
}

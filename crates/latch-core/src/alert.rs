/// Out-of-band notification for failures that are swallowed locally.
pub trait Alerter: Send + Sync {
    fn alert(&self, message: &str);
}

/// Emits alerts as error events on the `latch::alert` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, message: &str) {
        tracing::error!(target: "latch::alert", alert = %message, "Alert raised");
    }
}

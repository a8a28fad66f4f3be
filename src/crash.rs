use std::fmt::Display;

/// Sink for non-fatal errors worth reporting.
pub trait Crasher: Send + Sync {
  fn record_error(&self, error: &dyn Display, reason: &str);
}

/// Default sink: structured error log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCrasher;

impl Crasher for TracingCrasher {
  fn record_error(&self, error: &dyn Display, reason: &str) {
    tracing::error!(error = %error, reason, "recorded error");
  }
}

/// Runs a fallible bookkeeping step, reporting failures as `reason` instead of propagating them.
pub(crate) fn recover<T>(crasher: &dyn Crasher, reason: &str, op: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
  match op() {
    Ok(v) => Some(v),
    Err(e) => {
      crasher.record_error(&format!("{e:#}"), reason);
      None
    }
  }
}

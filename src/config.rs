//! Timeout configuration shared by the controller and the forwarder.

use std::time::Duration;

use thiserror::Error;

/// How long the controller keeps a query's context open.
pub const DNS_FLOW_TIMEOUT: Duration = Duration::from_secs(17);

/// Budget of one dial attempt (UDP exchange, or TCP connect plus exchange).
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} timeout must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("dial timeout ({dial:?}) must be shorter than the flow timeout ({flow:?})")]
    DialNotNested { dial: Duration, flow: Duration },
}

/// Nested deadlines: every dial attempt runs inside the per-flow budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Outer bound for a whole query, fallback included.
    pub flow: Duration,
    /// Inner bound for a single attempt.
    pub dial: Duration,
}

impl Timeouts {
    pub fn new(flow: Duration, dial: Duration) -> Result<Self, ConfigError> {
        let timeouts = Self { flow, dial };
        timeouts.validate()?;
        Ok(timeouts)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flow.is_zero() {
            return Err(ConfigError::ZeroTimeout("flow"));
        }
        if self.dial.is_zero() {
            return Err(ConfigError::ZeroTimeout("dial"));
        }
        if self.dial >= self.flow {
            return Err(ConfigError::DialNotNested {
                dial: self.dial,
                flow: self.flow,
            });
        }
        Ok(())
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            flow: DNS_FLOW_TIMEOUT,
            dial: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

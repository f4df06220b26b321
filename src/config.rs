//! Configuration for the operation orchestrator.
//!
//! Every runtime knob lives in [`OrchestratorConfig`], built through
//! [`OrchestratorConfigBuilder`]. Setters clamp to sane ranges; `build()`
//! rejects anything still out of bounds.

use crate::error::DocOpsError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Orchestrator configuration.
///
/// # Example
/// ```rust
/// use edgequake_docops::OrchestratorConfig;
///
/// let config = OrchestratorConfig::builder()
///     .exchange_timeout_secs(120)
///     .progress_tick_ms(250)
///     .build()
///     .unwrap();
/// assert_eq!(config.exchange_timeout_secs, 120);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Ceiling for one exchange attempt in seconds. Default: 300.
    ///
    /// Exceeding it fails the attempt with a `Timeout` reason. It is not a
    /// cancellation: fallback to the next technology still applies.
    pub exchange_timeout_secs: u64,

    /// Capacity of the session event broadcast channel. Default: 256.
    ///
    /// A subscriber that falls further behind than this skips events.
    pub event_capacity: usize,

    /// Interval between advisory processing-progress updates in ms. Default: 500.
    pub progress_tick_ms: u64,

    /// Time constant of the advisory processing estimate in seconds. Default: 30.
    pub expected_processing_secs: u64,

    /// Re-fetch the technology catalog when a session starts. Default: true.
    pub refresh_catalog_on_start: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            exchange_timeout_secs: 300,
            event_capacity: 256,
            progress_tick_ms: 500,
            expected_processing_secs: 30,
            refresh_catalog_on_start: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms)
    }

    pub fn expected_processing(&self) -> Duration {
        Duration::from_secs(self.expected_processing_secs)
    }

    /// Reject values the session runner cannot work with.
    pub fn validate(&self) -> Result<(), DocOpsError> {
        if self.exchange_timeout_secs == 0 {
            return Err(DocOpsError::InvalidConfig(
                "Exchange timeout must be ≥ 1s".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(DocOpsError::InvalidConfig(
                "Event capacity must be ≥ 1".into(),
            ));
        }
        if self.progress_tick_ms == 0 {
            return Err(DocOpsError::InvalidConfig(
                "Progress tick must be ≥ 1ms".into(),
            ));
        }
        if self.expected_processing_secs == 0 {
            return Err(DocOpsError::InvalidConfig(
                "Expected processing time must be ≥ 1s".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn exchange_timeout_secs(mut self, secs: u64) -> Self {
        self.config.exchange_timeout_secs = secs.clamp(1, 86_400);
        self
    }

    pub fn event_capacity(mut self, n: usize) -> Self {
        self.config.event_capacity = n.clamp(16, 65_536);
        self
    }

    pub fn progress_tick_ms(mut self, ms: u64) -> Self {
        self.config.progress_tick_ms = ms.clamp(10, 60_000);
        self
    }

    pub fn expected_processing_secs(mut self, secs: u64) -> Self {
        self.config.expected_processing_secs = secs.max(1);
        self
    }

    pub fn refresh_catalog_on_start(mut self, v: bool) -> Self {
        self.config.refresh_catalog_on_start = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<OrchestratorConfig, DocOpsError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.exchange_timeout_secs, 300);
        assert_eq!(c.event_capacity, 256);
        assert_eq!(c.progress_tick_ms, 500);
        assert_eq!(c.expected_processing_secs, 30);
        assert!(c.refresh_catalog_on_start);
    }

    #[test]
    fn setters_clamp() {
        let c = OrchestratorConfig::builder()
            .exchange_timeout_secs(0)
            .event_capacity(1)
            .progress_tick_ms(1)
            .build()
            .unwrap();
        assert_eq!(c.exchange_timeout_secs, 1);
        assert_eq!(c.event_capacity, 16);
        assert_eq!(c.progress_tick_ms, 10);
    }

    #[test]
    fn hand_built_zero_timeout_is_rejected() {
        let builder = OrchestratorConfigBuilder {
            config: OrchestratorConfig {
                exchange_timeout_secs: 0,
                ..Default::default()
            },
        };
        assert!(matches!(
            builder.build(),
            Err(DocOpsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn hand_built_zero_tick_fails_validation() {
        let config = OrchestratorConfig {
            progress_tick_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DocOpsError::InvalidConfig(msg)) if msg.contains("tick")
        ));
        assert!(OrchestratorConfig::default().validate().is_ok());
    }
}

//! Service-wide settings resolved from the command line.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EditError, Result};

/// Confidence cut-offs passed to the open-vocabulary detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionThresholds {
    pub box_threshold: f32,
    pub text_threshold: f32,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            box_threshold: 0.35,
            text_threshold: 0.25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub detection: DetectionThresholds,
    /// Square side the generative model works at.
    pub working_size: u32,
    /// Deadline for a single inference request.
    pub inference_timeout: Duration,
    /// Model calls allowed to run at once.
    pub max_concurrent_inferences: usize,
    /// Sessions kept before the least recently used one is evicted.
    pub max_sessions: usize,
    pub session_idle_ttl: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            detection: DetectionThresholds::default(),
            working_size: 1024,
            inference_timeout: Duration::from_secs(300),
            max_concurrent_inferences: 1,
            max_sessions: 64,
            session_idle_ttl: Duration::from_secs(3600),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |v: f32| (0.0..=1.0).contains(&v);
        if !unit(self.detection.box_threshold) || !unit(self.detection.text_threshold) {
            return Err(EditError::invalid(format!(
                "detection thresholds must be in [0, 1], got {:?}",
                self.detection
            )));
        }
        if self.working_size < 64 {
            return Err(EditError::invalid(format!(
                "working size must be at least 64, got {}",
                self.working_size
            )));
        }
        if self.inference_timeout.is_zero() {
            return Err(EditError::invalid("inference timeout must be positive"));
        }
        if self.max_concurrent_inferences == 0 {
            return Err(EditError::invalid(
                "max concurrent inferences must be at least 1",
            ));
        }
        if self.max_sessions == 0 {
            return Err(EditError::invalid("max sessions must be at least 1"));
        }
        if self.session_idle_ttl.is_zero() {
            return Err(EditError::invalid("session idle ttl must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection.box_threshold, 0.35);
        assert_eq!(config.detection.text_threshold, 0.25);
        assert_eq!(config.working_size, 1024);
    }

    #[test]
    fn test_invalid_thresholds() {
        let config = ServiceConfig {
            detection: DetectionThresholds {
                box_threshold: 1.2,
                text_threshold: 0.25,
            },
            ..ServiceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_runtime_limits() {
        let small = ServiceConfig {
            working_size: 16,
            ..ServiceConfig::default()
        };
        assert!(small.validate().is_err());

        let no_workers = ServiceConfig {
            max_concurrent_inferences: 0,
            ..ServiceConfig::default()
        };
        assert!(no_workers.validate().is_err());

        let no_deadline = ServiceConfig {
            inference_timeout: Duration::ZERO,
            ..ServiceConfig::default()
        };
        assert!(no_deadline.validate().is_err());

        let no_sessions = ServiceConfig {
            max_sessions: 0,
            ..ServiceConfig::default()
        };
        assert!(no_sessions.validate().is_err());

        let no_ttl = ServiceConfig {
            session_idle_ttl: Duration::ZERO,
            ..ServiceConfig::default()
        };
        assert!(no_ttl.validate().is_err());
    }
}

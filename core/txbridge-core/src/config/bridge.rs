//! Settings of the bridge layer itself (not forwarded to the engine).

use super::{Kwargs, duration_ms, from_kwargs, to_dict};
use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bridge-level knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeSettings {
    /// Upper bound for a blocking wait on a pending call. `None` waits for
    /// the engine indefinitely and relies on its own expiry.
    #[serde(
        default,
        with = "duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    completion_watchdog: Option<Duration>,
}

impl BridgeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_kwargs(kwargs: Kwargs) -> BridgeResult<Self> {
        let settings: Self = from_kwargs("bridge settings", kwargs)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn with_completion_watchdog(mut self, watchdog: Duration) -> Self {
        self.completion_watchdog = Some(watchdog);
        self
    }

    pub fn completion_watchdog(&self) -> Option<Duration> {
        self.completion_watchdog
    }

    pub fn to_dict(&self) -> Kwargs {
        to_dict(self)
    }

    fn validate(&self) -> BridgeResult<()> {
        if self.completion_watchdog == Some(Duration::ZERO) {
            return Err(BridgeError::Config(
                "completion_watchdog must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn watchdog_in_milliseconds() {
        let kwargs = json!({"completion_watchdog": 2500}).as_object().unwrap().clone();
        let settings = BridgeSettings::from_kwargs(kwargs.clone()).unwrap();
        assert_eq!(settings.completion_watchdog(), Some(Duration::from_millis(2500)));
        assert_eq!(settings.to_dict(), kwargs);
    }

    #[test]
    fn zero_watchdog_rejected() {
        let kwargs = json!({"completion_watchdog": 0}).as_object().unwrap().clone();
        assert!(matches!(
            BridgeSettings::from_kwargs(kwargs),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn default_is_empty() {
        assert!(BridgeSettings::new().to_dict().is_empty());
    }
}

//! Operator alerting on repeated degrades
//!
//! The only aggregate escalation above automation: `threshold` DEGRADED_COMPLETE
//! outcomes for one role inside a sliding window raise an alert. Degrades are
//! counted from the shared degrade log, so completions written by every worker
//! process sharing the project root count toward one window. After alerting,
//! this process only counts degrades newer than its alert, so one burst raises
//! one alert per process.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tether_core::{AlertSettings, Clock, Result};
use tracing::{error, warn};

use crate::degrade::DegradeSink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAlert {
    pub role: String,
    pub count: usize,
    pub window: Duration,
    pub raised_at: DateTime<Utc>,
}

pub struct DegradeAlerter {
    window: Duration,
    threshold: usize,
    log: Arc<dyn DegradeSink>,
    clock: Arc<dyn Clock>,
    last_alert: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DegradeAlerter {
    pub fn new(settings: AlertSettings, log: Arc<dyn DegradeSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: settings.window(),
            threshold: settings.threshold.max(1),
            log,
            clock,
            last_alert: Mutex::new(HashMap::new()),
        }
    }

    /// Check `role` after one of its DEGRADED_COMPLETE artifacts was written
    ///
    /// A log that cannot be read raises nothing; the degrade itself is
    /// already recorded.
    pub async fn record(&self, role: &str) -> Option<OperatorAlert> {
        let now = self.clock.now();
        let count = match self.pending_at(role, now).await {
            Ok(count) => count,
            Err(e) => {
                warn!(role, "cannot count recent degrades: {}", e);
                return None;
            }
        };

        if count < self.threshold {
            return None;
        }

        let alert = OperatorAlert {
            role: role.to_string(),
            count,
            window: self.window,
            raised_at: now,
        };
        self.last_alert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(role.to_string(), now);

        error!(
            role = %alert.role,
            count = alert.count,
            window_secs = alert.window.as_secs(),
            "OPERATOR ALERT: repeated degraded completions"
        );
        Some(alert)
    }

    /// Degrades currently counted for `role`
    async fn pending_at(&self, role: &str, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let last = self
            .last_alert
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(role)
            .copied();
        let since = last.map_or(cutoff, |last| last.max(cutoff));
        self.log.count_since(role, since).await
    }
}

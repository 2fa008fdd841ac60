//! Retry logic with exponential backoff for dialing the device.
//!
//! Only connection establishment is retried. Commands issued over an
//! established connection are never retried here.

use crate::error::{Error, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial attempt)
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 2000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30000,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            ..Self::default()
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt as i32))
            .min(self.max_delay_ms as f64) as u64;

        Duration::from_millis(delay_ms)
    }
}

/// Retries a blocking operation with exponential backoff.
///
/// Must be called from a blocking context; the delay sleeps the thread.
/// Returns the last error if every attempt fails.
pub fn retry_with_backoff<T, F>(
    config: &RetryConfig,
    mut operation: F,
    operation_name: &str,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_error = match operation() {
        Ok(result) => return Ok(result),
        Err(e) => {
            debug!("{} failed on initial attempt: {}", operation_name, e);
            e
        }
    };

    for attempt in 1..=config.max_retries {
        let delay = config.calculate_delay(attempt - 1);
        warn!(
            "Retrying {} (attempt {}/{}) after {:?}",
            operation_name, attempt, config.max_retries, delay
        );

        thread::sleep(delay);

        match operation() {
            Ok(result) => {
                debug!("{} succeeded on attempt {}", operation_name, attempt);
                return Ok(result);
            }
            Err(e) => {
                debug!("{} failed on attempt {}: {}", operation_name, attempt, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Builds a troubleshooting message for a failed dial.
pub fn diagnose_ssh_error(error: &Error, address: &str, ssh_key: Option<&str>) -> String {
    let error_str = error.to_string().to_lowercase();

    let mut suggestions = Vec::new();

    if error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("no route to host")
    {
        suggestions.push(format!("• Verify the device at '{}' is powered and reachable", address));
        suggestions.push("• The device may still be rebooting, try again shortly".to_string());
    }

    if error_str.contains("authentication")
        || error_str.contains("permission denied")
        || error_str.contains("publickey")
    {
        match ssh_key {
            Some(key) => {
                suggestions.push(format!("• Check that the testing key exists: {}", key));
                suggestions.push("• Verify the device runs a test image accepting that key".to_string());
            }
            None => {
                suggestions.push("• Set dut.ssh_key to the testing key in the configuration".to_string());
                suggestions.push("• Verify your SSH agent is running (ssh-add -l)".to_string());
            }
        }
    }

    if error_str.contains("resolve") || error_str.contains("no addresses") {
        suggestions.push("• Add the device to the `hosts` table of the configuration".to_string());
    }

    if suggestions.is_empty() {
        suggestions.push(format!("• Test the connection manually: ssh {}", address));
    }

    format!(
        "SSH connection to {} failed: {}\n\nTroubleshooting suggestions:\n{}",
        address,
        error,
        suggestions.join("\n")
    )
}

//! Reachability probe for port-forwarded services
//!
//! The probe polls `http://<host>:<port>/testimage-id` under a
//! [`BackoffSchedule`]. It either expects the service to answer with an exact
//! body, or expects the connection itself to fail.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use trustprobe_common::HarnessError;

use crate::backoff::{BackoffSchedule, Sleeper, TokioSleeper};

/// Path fetched on every attempt
pub const PROBE_PATH: &str = "/testimage-id";

/// Per-request timeout unless configured otherwise
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// What a probe run is checking
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeSpec {
    pub host: String,
    pub port: u16,
    /// True when the target is expected to be torn down
    pub expect_failure: bool,
    /// Exact body when success is expected, error substring otherwise
    pub expected: String,
}

impl ProbeSpec {
    /// Expect `localhost:<port>` to answer with exactly `body`
    pub fn reachable(port: u16, body: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
            expect_failure: false,
            expected: body.into(),
        }
    }

    /// Expect `localhost:<port>` to refuse, with an error containing `substring`
    pub fn unreachable(port: u16, substring: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port,
            expect_failure: true,
            expected: substring.into(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn url(&self) -> String {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("http://{}:{}{}", host, self.port, PROBE_PATH)
    }
}

/// How the probe run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The service answered with the expected body
    Reachable { body: String },
    /// The connection failed as expected
    Unreachable { error: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    /// Attempts made, including the final one
    pub attempts: u32,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{url} still unreachable after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("expected an error containing {expected:?}, got: {actual}")]
    UnexpectedError { expected: String, actual: String },

    #[error("expected body {expected:?}, got {actual:?}")]
    BodyMismatch { expected: String, actual: String },

    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),
}

/// Flatten an error and its sources into one line
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

/// Expected probe body for an image reference: its tag followed by a newline.
///
/// `quay.io/libpod/testimage:20241011` gives `"20241011\n"`.
pub fn image_id_body(reference: &str) -> String {
    let tag = reference
        .rsplit_once(':')
        .filter(|(_, tag)| !tag.contains('/'))
        .map(|(_, tag)| tag)
        .unwrap_or_default();
    format!("{}\n", tag)
}

/// Runs probes with a shared HTTP client
pub struct Prober {
    client: reqwest::Client,
    schedule: BackoffSchedule,
    sleeper: Arc<dyn Sleeper>,
}

impl Prober {
    /// A prober that really sleeps between attempts
    pub fn new(schedule: BackoffSchedule, request_timeout: Duration) -> Result<Self, HarnessError> {
        Self::with_sleeper(schedule, request_timeout, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        schedule: BackoffSchedule,
        request_timeout: Duration,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, HarnessError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .no_proxy()
            .build()
            .map_err(|e| HarnessError::Client(error_chain(&e)))?;

        Ok(Self {
            client,
            schedule,
            sleeper,
        })
    }

    pub fn schedule(&self) -> BackoffSchedule {
        self.schedule
    }

    /// Poll the target until it answers or the schedule runs out.
    ///
    /// With `expect_failure` set, the first transport error ends the run.
    pub async fn probe(&self, spec: &ProbeSpec) -> Result<ProbeReport, ProbeError> {
        let url = spec.url();
        let mut last_error = String::new();

        for attempt in 0..self.schedule.max_attempts() {
            let attempts = attempt + 1;

            match self.client.get(&url).send().await {
                Ok(resp) => {
                    tracing::debug!("{} answered {} on attempt {}", url, resp.status(), attempts);
                    let body = resp.bytes().await.map_err(ProbeError::Body)?;
                    if body.as_ref() != spec.expected.as_bytes() {
                        return Err(ProbeError::BodyMismatch {
                            expected: spec.expected.clone(),
                            actual: String::from_utf8_lossy(&body).into_owned(),
                        });
                    }
                    return Ok(ProbeReport {
                        attempts,
                        outcome: ProbeOutcome::Reachable {
                            body: spec.expected.clone(),
                        },
                    });
                }
                Err(e) => {
                    let error = error_chain(&e);

                    if spec.expect_failure {
                        if error.contains(&spec.expected) {
                            tracing::debug!("{} unreachable as expected: {}", url, error);
                            return Ok(ProbeReport {
                                attempts,
                                outcome: ProbeOutcome::Unreachable { error },
                            });
                        }
                        return Err(ProbeError::UnexpectedError {
                            expected: spec.expected.clone(),
                            actual: error,
                        });
                    }

                    tracing::debug!("Attempt {} against {} failed: {}", attempts, url, error);
                    last_error = error;
                    if let Some(delay) = self.schedule.delay_after(attempt) {
                        self.sleeper.sleep(delay).await;
                    }
                }
            }
        }

        tracing::warn!("{} unreachable after {} attempts", url, self.schedule.max_attempts());
        Err(ProbeError::Exhausted {
            url,
            attempts: self.schedule.max_attempts(),
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_url() {
        let spec = ProbeSpec::reachable(62544, "x\n");
        assert_eq!(spec.url(), "http://localhost:62544/testimage-id");
    }

    #[test]
    fn test_probe_url_ipv6_host() {
        let spec = ProbeSpec::unreachable(8080, "").with_host("::1");
        assert_eq!(spec.url(), "http://[::1]:8080/testimage-id");
    }

    #[test]
    fn test_image_id_body() {
        assert_eq!(image_id_body("quay.io/libpod/testimage:20241011"), "20241011\n");
        assert_eq!(image_id_body("localhost:5000/testimage"), "\n");
    }

    #[test]
    fn test_error_chain_skips_repeated_text() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let outer = HarnessError::Io(inner);
        assert_eq!(error_chain(&outer), "IO error: refused");
    }
}

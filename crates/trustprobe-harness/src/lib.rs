//! Network verification harness
//!
//! Two checks for a client that reaches services over a forwarded path:
//! a backing-off reachability [`Prober`], and a [`TrustServer`] that records
//! what a client sends it so transport trust enforcement can be asserted.

pub mod backoff;
pub mod certificates;
pub mod expectations;
pub mod probe;
pub mod registry_client;
pub mod scenario;
pub mod trust_server;

pub use backoff::{BackoffSchedule, RecordingSleeper, Sleeper, TokioSleeper};
pub use certificates::TestCertificates;
pub use expectations::{expected_cause, expected_pull_error, render_cli_error, Platform, TrustFailure};
pub use probe::{image_id_body, ProbeError, ProbeOutcome, ProbeReport, ProbeSpec, Prober};
pub use registry_client::{PingFailure, PingResponse, RegistryClient, RegistryError};
pub use scenario::{ClientOutcome, ClientUnderTest, ScenarioError, TrustReport, TrustScenario};
pub use trust_server::{
    RequestLog, ServeCompletion, ServeError, TlsMaterial, TrustServer, TrustServerConfig,
};
pub use trustprobe_common::HarnessError;

/// Image whose tag the port-forward scenario's web server serves
pub const TESTIMAGE: &str = "quay.io/libpod/testimage:20241011";

//! Remote build service: typed client and log polling.

pub mod client;
pub mod poller;

pub use client::{BuildResponse, BuildServiceClient, ImproveResponse, RunResponse};
pub use poller::{LogEvent, LogPoller};

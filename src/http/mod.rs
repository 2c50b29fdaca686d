//! HTTP plumbing: URL planning, per-user client construction, and request
//! execution with retries.
pub mod client;
pub mod executor;
pub mod url;

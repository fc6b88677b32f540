//! Test utilities for Poto.
//!
//! [`TestApp`] dispatches requests against an assembled router in-process
//! via `tower::ServiceExt::oneshot`, without binding a TCP port.

mod app;
mod sse;

pub use app::{TestApp, TestResponse};
pub use sse::{parse_sse_frames, SseFrame};

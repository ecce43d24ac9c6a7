//! Integration tests for the processing core.

mod stt_live_tests;
mod support;

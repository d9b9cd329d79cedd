//! Integration test binary: every coordinator scenario runs against the
//! fakes in `helpers` in a single test binary.
//!
//! See the matklad pattern: <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

// Allow unwrap/expect in test code
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod helpers;

mod audio_path;
mod persistence;
mod turn_taking;

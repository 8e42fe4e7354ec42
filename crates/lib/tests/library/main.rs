//! Integration tests for arbor-lib.

mod common;
mod pipeline_tests;
mod project_tests;

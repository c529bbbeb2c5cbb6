//! Change sync pipeline for cadence.
//!
//! Publishes what task runs left in the working tree: detects changes,
//! commits them with a structured message, pushes without ever forcing, and
//! optionally opens a review request on the hosting service.
//!
//! # Main types
//!
//! - [`SyncPipeline`]: The detect, commit, push and review sequence.
//! - [`VcsDriver`] / [`GitCli`]: Version control through the `git` executable.
//! - [`ReviewProvider`] / [`GitHubReviewProvider`]: Pull requests over the GitHub REST API.
//! - [`SyncConfig`]: The `[sync]` configuration section.

/// `[sync]` and `[sync.review]` configuration.
pub mod config;
/// `git` command-line driver.
pub mod git;
/// Sync pipeline orchestration.
pub mod pipeline;
/// Review request providers.
pub mod review;

pub use config::{ReviewConfig, SyncConfig};
pub use git::{GitCli, VcsDriver};
pub use pipeline::{SyncOptions, SyncPipeline, DIVERGED};
pub use review::{GitHubReviewProvider, ReviewProvider, ReviewRequest};

//! Bounded retry policies with exponential backoff.

mod factory;
mod policy;

pub use factory::{FixedRetryPolicyFactory, RetryPolicyFactory};
pub use policy::{RetryPolicy, RetryPolicyError};

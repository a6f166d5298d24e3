use super::RetryPolicy;

/// Factory producing a bounded retry policy per (queue, message).
///
/// The consume pipeline asks its factory for a policy before every
/// execution. Parameterizing by queue and message id lets an
/// implementation vary the budget per queue, or resume a persisted
/// attempt count for a specific message across process restarts, without
/// the pipeline's contract changing.
pub trait RetryPolicyFactory: Send + Sync {
    fn create_policy(&self, queue: &str, message_id: i64) -> RetryPolicy;
}

/// Factory returning the same policy for every queue and message.
#[derive(Clone, Debug, Default)]
pub struct FixedRetryPolicyFactory {
    policy: RetryPolicy,
}

impl FixedRetryPolicyFactory {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl RetryPolicyFactory for FixedRetryPolicyFactory {
    fn create_policy(&self, _queue: &str, _message_id: i64) -> RetryPolicy {
        self.policy.clone()
    }
}

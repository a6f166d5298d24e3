/// Acknowledgement decision returned by a consumer's fallback.
///
/// The mapping to broker acknowledgement is fixed: `Ack` acks; `Nack`
/// nacks with the queue's requeue-on-exhausted default; the two explicit
/// variants override that default in either direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsumerState {
    /// Acknowledge the delivery as handled (compensation succeeded).
    Ack,
    /// Reject; whether the broker requeues follows the per-queue default.
    #[default]
    Nack,
    /// Reject and requeue, regardless of the per-queue default.
    NackAndRequeue,
    /// Reject without requeue, regardless of the per-queue default.
    NackAndNoRequeue,
}

impl ConsumerState {
    /// Resolve the concrete requeue flag given the per-queue default.
    /// Returns `None` for `Ack`.
    pub fn requeue(self, default_requeue: bool) -> Option<bool> {
        match self {
            Self::Ack => None,
            Self::Nack => Some(default_requeue),
            Self::NackAndRequeue => Some(true),
            Self::NackAndNoRequeue => Some(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_follows_the_default_overrides_do_not() {
        assert_eq!(ConsumerState::Ack.requeue(true), None);
        assert_eq!(ConsumerState::Nack.requeue(true), Some(true));
        assert_eq!(ConsumerState::Nack.requeue(false), Some(false));
        assert_eq!(ConsumerState::NackAndRequeue.requeue(false), Some(true));
        assert_eq!(ConsumerState::NackAndNoRequeue.requeue(true), Some(false));
    }
}

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::error::Error;

/// Observer for rebalance lifecycle events.
///
/// Every `rebalance_start` is followed by exactly one `rebalance_ok` or
/// `rebalance_error` for the same group before the next start.
pub trait Notifier: Send + Sync + 'static {
    fn rebalance_start(&self, group: &str);
    fn rebalance_ok(&self, group: &str);
    fn rebalance_error(&self, group: &str, error: &Error);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl Notifier for LoggingNotifier {
    fn rebalance_start(&self, group: &str) {
        info!(group, "rebalance started");
    }

    fn rebalance_ok(&self, group: &str) {
        info!(group, "rebalance completed");
    }

    fn rebalance_error(&self, group: &str, error: &Error) {
        error!(group, error = %error, "rebalance failed");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Start { group: String },
    Ok { group: String },
    Error { group: String, cause: String },
}

/// Publishes rebalance events on an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RebalanceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn publish(&self, event: RebalanceEvent) {
        // A dropped receiver just means nobody is listening.
        if self.tx.send(event).is_err() {
            tracing::trace!("rebalance event receiver dropped");
        }
    }
}

impl Notifier for ChannelNotifier {
    fn rebalance_start(&self, group: &str) {
        self.publish(RebalanceEvent::Start {
            group: group.to_string(),
        });
    }

    fn rebalance_ok(&self, group: &str) {
        self.publish(RebalanceEvent::Ok {
            group: group.to_string(),
        });
    }

    fn rebalance_error(&self, group: &str, error: &Error) {
        self.publish(RebalanceEvent::Error {
            group: group.to_string(),
            cause: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_notifier_records_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.rebalance_start("g");
        notifier.rebalance_error("g", &Error::NoConsumers);
        notifier.rebalance_start("g");
        notifier.rebalance_ok("g");

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            events,
            vec![
                RebalanceEvent::Start { group: "g".into() },
                RebalanceEvent::Error {
                    group: "g".into(),
                    cause: "cannot assign partitions without consumers".into()
                },
                RebalanceEvent::Start { group: "g".into() },
                RebalanceEvent::Ok { group: "g".into() },
            ]
        );
    }

    #[test]
    fn dropped_receiver_is_harmless() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.rebalance_start("g");
    }
}

//! What the receiver needs from the process hosting it.

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::ReceiverError;

/// The hosting process.
///
/// The receiver calls [`Host::report_fatal_error`] when one of its
/// background loops fails in a way it cannot recover from. The call must not
/// block; what happens next (restart, exit) is up to the host.
#[cfg_attr(test, mockall::automock)]
pub trait Host: Send + Sync {
    fn report_fatal_error(&self, err: ReceiverError);
}

/// A [`Host`] that delivers the first fatal error over a oneshot channel.
///
/// Later errors are logged and dropped: by the time a second loop fails the
/// host has already been told the receiver is unusable.
#[derive(Debug)]
pub struct FatalErrorSignal {
    tx: Mutex<Option<oneshot::Sender<ReceiverError>>>,
}

impl FatalErrorSignal {
    pub fn new() -> (Self, oneshot::Receiver<ReceiverError>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    pub fn is_raised(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl Host for FatalErrorSignal {
    fn report_fatal_error(&self, err: ReceiverError) {
        let sender = self.tx.lock().take();
        match sender {
            Some(tx) => {
                if let Err(err) = tx.send(err) {
                    warn!(target: "scrapeline::receiver", error = %err, "fatal error raised with nobody listening");
                }
            }
            None => {
                warn!(target: "scrapeline::receiver", error = %err, "dropping fatal error reported after the first");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_error_wins() {
        let (signal, rx) = FatalErrorSignal::new();
        assert!(!signal.is_raised());

        signal.report_fatal_error(ReceiverError::Discovery("first".into()));
        signal.report_fatal_error(ReceiverError::Scrape("second".into()));

        assert!(signal.is_raised());
        let err = rx.await.unwrap();
        assert!(matches!(err, ReceiverError::Discovery(msg) if msg == "first"));
    }

    #[test]
    fn reporting_without_listener_does_not_panic() {
        let (signal, rx) = FatalErrorSignal::new();
        drop(rx);
        signal.report_fatal_error(ReceiverError::Scrape("late".into()));
        assert!(signal.is_raised());
    }
}

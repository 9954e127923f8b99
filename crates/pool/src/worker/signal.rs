//! Control signals sent from the pool to a worker's execution context

use std::fmt;

use tokio::sync::watch;

/// Signal observed by the execution context
///
/// Signals only escalate: once a stronger signal is set a weaker one cannot
/// replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControlSignal {
    /// Keep processing
    Run,
    /// Cancel queued tasks, finish the current one, then exit
    StopAndDrain,
    /// Drop queued tasks and abort the current one at its next await point
    TerminateNow,
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::StopAndDrain => write!(f, "stop_and_drain"),
            Self::TerminateNow => write!(f, "terminate_now"),
        }
    }
}

/// Pool-side sender half
pub(crate) struct SignalSender {
    tx: watch::Sender<ControlSignal>,
}

impl SignalSender {
    pub(crate) fn channel() -> (Self, watch::Receiver<ControlSignal>) {
        let (tx, rx) = watch::channel(ControlSignal::Run);
        (Self { tx }, rx)
    }

    /// Raise the signal; returns false if the context has gone away
    pub(crate) fn raise(&self, signal: ControlSignal) -> bool {
        if self.tx.is_closed() {
            return false;
        }
        self.tx.send_modify(|current| {
            if signal > *current {
                *current = signal;
            }
        });
        true
    }

    pub(crate) fn current(&self) -> ControlSignal {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signals_only_escalate() {
        let (sender, rx) = SignalSender::channel();
        assert_eq!(*rx.borrow(), ControlSignal::Run);

        assert!(sender.raise(ControlSignal::TerminateNow));
        assert!(sender.raise(ControlSignal::StopAndDrain));
        assert_eq!(*rx.borrow(), ControlSignal::TerminateNow);
        assert_eq!(sender.current(), ControlSignal::TerminateNow);
    }

    #[test]
    fn test_raise_fails_without_receiver() {
        let (sender, rx) = SignalSender::channel();
        drop(rx);
        assert!(!sender.raise(ControlSignal::StopAndDrain));
    }
}

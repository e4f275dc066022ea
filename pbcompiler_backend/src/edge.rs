//! The edge signal source: asynchronous notifications that the board has
//! reached an execution boundary.
//!
//! Drivers deliver edge callbacks from their own context (a monitoring thread
//! or worse), so the callback surface here is deliberately narrow: exactly one
//! event type, [`EdgeEvent`], and exactly one delivery mechanism, an
//! [`EdgeNotifier`] whose `notify()` enqueues the event onto the controller's
//! queue and returns immediately. All state mutation happens later, on the
//! thread that drains the queue. `notify()` never blocks and never fails;
//! an event sent after teardown is silently dropped.
//!
//! [`EdgeSource`] is the subscription surface a driver adapter implements;
//! [`ManualEdgeSource`] is the in-memory implementation used by tests and
//! bench setups without a wired trigger line, where `fire()` stands in for
//! the physical transition.

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::error::{Result, SequencerError};

/// Which transition of the monitored line counts as an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgePolarity {
    Rising,
    Falling,
}

/// Trigger-line configuration, passed in at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    /// Driver-defined digital-line identifier, e.g. `"Dev1/port0/line0"`.
    pub line: String,
    pub polarity: EdgePolarity,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            line: "Dev1/port0/line0".to_string(),
            polarity: EdgePolarity::Rising,
        }
    }
}

/// One qualifying transition on the monitored line. Carries no payload; the
/// meaning of the k-th event is positional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent;

/// Sending half of the edge queue, handed to the driver at subscription.
///
/// Cheap to clone; every clone feeds the same queue.
#[derive(Debug, Clone)]
pub struct EdgeNotifier {
    tx: Sender<EdgeEvent>,
}

impl EdgeNotifier {
    /// Enqueues one edge event. Never blocks; if the consuming side is gone
    /// the event is dropped, which is exactly what a late driver callback
    /// after teardown should amount to.
    pub fn notify(&self) {
        let _ = self.tx.send(EdgeEvent);
    }
}

/// Creates the edge queue: the notifier for the driver side and the receiver
/// for the control side.
pub fn edge_channel() -> (EdgeNotifier, Receiver<EdgeEvent>) {
    let (tx, rx) = unbounded();
    (EdgeNotifier { tx }, rx)
}

/// Subscription surface of an edge-detecting driver.
pub trait EdgeSource {
    /// Driver-specific subscription token, consumed by `unsubscribe`.
    type Handle;

    /// Registers for transitions of `polarity` on `line`. The driver fires
    /// `notifier.notify()` once per qualifying transition.
    fn subscribe(
        &mut self,
        line: &str,
        polarity: EdgePolarity,
        notifier: EdgeNotifier,
    ) -> Result<Self::Handle>;

    /// Tears down a subscription. Best-effort: callers treat failures as
    /// non-fatal and only log them.
    fn unsubscribe(&mut self, handle: Self::Handle) -> Result<()>;

    /// Arms the driver so registered transitions are actually delivered.
    /// Separate from `subscribe` because drivers separate registration from
    /// task start.
    fn start(&mut self) -> Result<()>;
}

/// In-memory edge source: records the subscription, and [`fire`] stands in
/// for a physical transition.
///
/// [`fire`]: ManualEdgeSource::fire
#[derive(Debug, Default)]
pub struct ManualEdgeSource {
    subscription: Option<(usize, String, EdgePolarity, EdgeNotifier)>,
    next_handle: usize,
    armed: bool,
    fired: usize,
}

impl ManualEdgeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates one qualifying transition. Returns whether a subscribed,
    /// armed listener was notified.
    pub fn fire(&mut self) -> bool {
        match &self.subscription {
            Some((_, _, _, notifier)) if self.armed => {
                notifier.notify();
                self.fired += 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Line of the live subscription, if any.
    pub fn line(&self) -> Option<&str> {
        self.subscription.as_ref().map(|(_, line, _, _)| line.as_str())
    }

    pub fn polarity(&self) -> Option<EdgePolarity> {
        self.subscription.as_ref().map(|(_, _, pol, _)| *pol)
    }

    /// Number of transitions delivered so far.
    pub fn fired(&self) -> usize {
        self.fired
    }
}

impl EdgeSource for ManualEdgeSource {
    type Handle = usize;

    fn subscribe(
        &mut self,
        line: &str,
        polarity: EdgePolarity,
        notifier: EdgeNotifier,
    ) -> Result<usize> {
        if self.subscription.is_some() {
            return Err(SequencerError::EdgeSource(
                "already subscribed; unsubscribe first".to_string(),
            ));
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.subscription = Some((handle, line.to_string(), polarity, notifier));
        Ok(handle)
    }

    fn unsubscribe(&mut self, handle: usize) -> Result<()> {
        match &self.subscription {
            Some((live, _, _, _)) if *live == handle => {
                self.subscription = None;
                self.armed = false;
                Ok(())
            }
            _ => Err(SequencerError::EdgeSource(format!(
                "no live subscription with handle {handle}"
            ))),
        }
    }

    fn start(&mut self) -> Result<()> {
        if self.subscription.is_none() {
            return Err(SequencerError::EdgeSource(
                "cannot arm without a subscription".to_string(),
            ));
        }
        self.armed = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn notify_is_queued_not_lost() {
        let (notifier, rx) = edge_channel();
        for _ in 0..5 {
            notifier.notify();
        }
        assert_eq!(rx.try_iter().count(), 5);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notify_after_receiver_drop_is_silent() {
        let (notifier, rx) = edge_channel();
        drop(rx);
        notifier.notify();
    }

    #[test]
    fn subscribe_fire_unsubscribe() {
        let (notifier, rx) = edge_channel();
        let mut source = ManualEdgeSource::new();

        assert!(!source.fire(), "nothing subscribed yet");

        let handle = source
            .subscribe("Dev1/port0/line0", EdgePolarity::Rising, notifier)
            .unwrap();
        assert!(source.is_subscribed());
        assert_eq!(source.line(), Some("Dev1/port0/line0"));
        assert_eq!(source.polarity(), Some(EdgePolarity::Rising));

        assert!(!source.fire(), "subscribed but not armed");
        source.start().unwrap();
        assert!(source.fire());
        assert_eq!(rx.try_iter().count(), 1);

        source.unsubscribe(handle).unwrap();
        assert!(!source.is_subscribed());
        assert!(!source.fire());
    }

    #[test]
    fn double_subscribe_is_rejected() {
        let (notifier, _rx) = edge_channel();
        let mut source = ManualEdgeSource::new();
        source
            .subscribe("line", EdgePolarity::Rising, notifier.clone())
            .unwrap();
        let err = source.subscribe("line", EdgePolarity::Falling, notifier);
        assert!(matches!(err, Err(SequencerError::EdgeSource(_))));
    }

    #[test]
    fn stale_handle_is_rejected() {
        let (notifier, _rx) = edge_channel();
        let mut source = ManualEdgeSource::new();
        let handle = source
            .subscribe("line", EdgePolarity::Rising, notifier)
            .unwrap();
        source.unsubscribe(handle).unwrap();
        assert!(matches!(
            source.unsubscribe(handle),
            Err(SequencerError::EdgeSource(_))
        ));
    }

    #[test]
    fn arm_requires_subscription() {
        let mut source = ManualEdgeSource::new();
        assert!(source.start().is_err());
    }
}

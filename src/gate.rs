//! Operator confirmation before expensive searches.
//!
//! When the anticipated number of partitions exceeds the warning threshold,
//! the worker posts a prompt with a runtime estimate and blocks until the
//! controlling surface answers. A negative answer cancels the search before
//! it starts.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::error::OptimizationError;
use crate::estimate::{describe_duration, estimated_seconds};

/// Answers whether a large search should go ahead.
///
/// Called from the worker; implementations may block.
pub trait Confirm {
    fn confirm(&self, message: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool,
{
    fn confirm(&self, message: &str) -> bool {
        self(message)
    }
}

/// Approves every search.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysConfirm;

impl Confirm for AlwaysConfirm {
    fn confirm(&self, _message: &str) -> bool {
        true
    }
}

/// Declines every search that needs confirmation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverConfirm;

impl Confirm for NeverConfirm {
    fn confirm(&self, _message: &str) -> bool {
        false
    }
}

/// A pending question for the controlling surface.
#[derive(Debug)]
pub struct ConfirmationRequest {
    pub message: String,
    pub reply: oneshot::Sender<bool>,
}

/// Worker side of the confirmation handshake.
///
/// Each call posts one [`ConfirmationRequest`] and parks the calling thread
/// on its oneshot reply. A dropped reply handle or a closed channel counts
/// as a refusal. Must not be used from inside an async context.
#[derive(Clone, Debug)]
pub struct ChannelConfirm {
    requests: mpsc::UnboundedSender<ConfirmationRequest>,
}

impl Confirm for ChannelConfirm {
    fn confirm(&self, message: &str) -> bool {
        let (reply, answer) = oneshot::channel();
        let request = ConfirmationRequest {
            message: message.to_string(),
            reply,
        };
        if self.requests.send(request).is_err() {
            debug!("confirmation channel closed, treating as declined");
            return false;
        }
        answer.blocking_recv().unwrap_or(false)
    }
}

/// Creates a connected worker/surface pair.
pub fn confirmation_channel() -> (ChannelConfirm, mpsc::UnboundedReceiver<ConfirmationRequest>) {
    let (requests, receiver) = mpsc::unbounded_channel();
    (ChannelConfirm { requests }, receiver)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Idle,
    Estimating,
    AwaitingConfirmation,
    Proceeding,
    Cancelled,
}

/// What the operator is asked before a large search.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfirmationPrompt {
    pub partitions: u128,
    pub estimated_seconds: f64,
    pub message: String,
}

/// Guards the partition search of one request.
#[derive(Debug)]
pub struct ConfirmationGate {
    warning_threshold: u128,
    seconds_per_partition: f64,
    state: GateState,
}

impl ConfirmationGate {
    pub fn new(warning_threshold: u128, seconds_per_partition: f64) -> Self {
        Self {
            warning_threshold,
            seconds_per_partition,
            state: GateState::Idle,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Decides whether a search over `partitions` candidates may run.
    ///
    /// `on_prompt` is invoked right before `confirm` is consulted, so
    /// observers see the question even while the worker is blocked.
    pub fn check<C>(
        &mut self,
        items: usize,
        partitions: u128,
        confirm: &C,
        mut on_prompt: impl FnMut(&ConfirmationPrompt),
    ) -> Result<(), OptimizationError>
    where
        C: Confirm + ?Sized,
    {
        self.state = GateState::Estimating;
        if partitions <= self.warning_threshold {
            self.state = GateState::Proceeding;
            return Ok(());
        }

        let seconds = estimated_seconds(partitions, self.seconds_per_partition);
        let prompt = ConfirmationPrompt {
            partitions,
            estimated_seconds: seconds,
            message: format!(
                "Optimizing {items} items means evaluating {partitions} possible parcel \
                 combinations, which may take about {}. Continue?",
                describe_duration(seconds)
            ),
        };

        self.state = GateState::AwaitingConfirmation;
        on_prompt(&prompt);

        if confirm.confirm(&prompt.message) {
            self.state = GateState::Proceeding;
            Ok(())
        } else {
            self.state = GateState::Cancelled;
            info!(items, partitions = %partitions, "large search declined");
            Err(OptimizationError::SearchAborted { partitions })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::thread;

    use crate::estimate::DEFAULT_SECONDS_PER_PARTITION;

    #[test]
    fn small_searches_skip_confirmation() {
        let asked = Cell::new(false);
        let confirm = |_: &str| {
            asked.set(true);
            false
        };
        let mut gate = ConfirmationGate::new(10_000, DEFAULT_SECONDS_PER_PARTITION);

        gate.check(8, 4140, &confirm, |_| {}).unwrap();

        assert!(!asked.get());
        assert_eq!(gate.state(), GateState::Proceeding);
    }

    #[test]
    fn declined_prompt_cancels() {
        let mut gate = ConfirmationGate::new(10_000, DEFAULT_SECONDS_PER_PARTITION);
        let mut prompts = Vec::new();

        let err = gate
            .check(10, 115_975, &NeverConfirm, |p| prompts.push(p.clone()))
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(gate.state(), GateState::Cancelled);
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].message.contains("115975"));
        assert!(prompts[0].message.contains("0.35s"));
    }

    #[test]
    fn approved_prompt_proceeds() {
        let mut gate = ConfirmationGate::new(10, DEFAULT_SECONDS_PER_PARTITION);
        gate.check(5, 52, &AlwaysConfirm, |_| {}).unwrap();
        assert_eq!(gate.state(), GateState::Proceeding);
    }

    #[test]
    fn channel_handshake_delivers_answer() {
        let (confirm, mut requests) = confirmation_channel();

        let worker = thread::spawn(move || confirm.confirm("go?"));
        let request = requests.blocking_recv().unwrap();
        assert_eq!(request.message, "go?");
        request.reply.send(true).unwrap();

        assert!(worker.join().unwrap());
    }

    #[test]
    fn dropped_reply_counts_as_declined() {
        let (confirm, mut requests) = confirmation_channel();

        let worker = thread::spawn(move || confirm.confirm("go?"));
        let request = requests.blocking_recv().unwrap();
        drop(request);

        assert!(!worker.join().unwrap());
    }

    #[test]
    fn closed_channel_counts_as_declined() {
        let (confirm, requests) = confirmation_channel();
        drop(requests);
        assert!(!confirm.confirm("go?"));
    }
}

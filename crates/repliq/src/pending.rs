//! `PendingCall`: the handle returned by [`Replica::call`](crate::Replica::call).

use repliq_protocol::Value;
use tokio::sync::{mpsc, oneshot};

use crate::actor::Command;
use crate::{CallError, ReplicaId};

type CallResult = Result<Value, CallError>;

/// The eventual result of a remote method call.
///
/// The call is already on its way when this handle is returned. Poll it
/// with [`is_ready`](Self::is_ready), await it with [`wait`](Self::wait),
/// or give up with [`cancel`](Self::cancel). No timeout is applied; wrap
/// `wait` in `tokio::time::timeout` if you need one.
#[derive(Debug)]
pub struct PendingCall {
    state: CallState,
}

#[derive(Debug)]
enum CallState {
    Waiting {
        rx: oneshot::Receiver<CallResult>,
        call_id: u64,
        replica: ReplicaId,
        commands: mpsc::UnboundedSender<Command>,
    },
    Done(CallResult),
}

impl PendingCall {
    pub(crate) fn waiting(
        rx: oneshot::Receiver<CallResult>,
        call_id: u64,
        replica: ReplicaId,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            state: CallState::Waiting {
                rx,
                call_id,
                replica,
                commands,
            },
        }
    }

    /// A call that finished (or failed) without a round trip.
    pub(crate) fn done(result: CallResult) -> Self {
        Self {
            state: CallState::Done(result),
        }
    }

    /// Returns `true` once the result is available. Never blocks.
    pub fn is_ready(&mut self) -> bool {
        let CallState::Waiting { rx, .. } = &mut self.state else {
            return true;
        };
        let result = match rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return false,
            Err(oneshot::error::TryRecvError::Closed) => Err(CallError::ConnectionLost),
        };
        self.state = CallState::Done(result);
        true
    }

    /// The result, if [`is_ready`](Self::is_ready) has seen it arrive.
    pub fn result(&self) -> Option<&CallResult> {
        match &self.state {
            CallState::Done(result) => Some(result),
            CallState::Waiting { .. } => None,
        }
    }

    /// Waits for the reply.
    pub async fn wait(self) -> CallResult {
        match self.state {
            CallState::Done(result) => result,
            // A dropped sender means the node went away mid-call.
            CallState::Waiting { rx, .. } => rx.await.unwrap_or(Err(CallError::ConnectionLost)),
        }
    }

    /// Abandons the call. A reply that still arrives is discarded.
    pub fn cancel(self) -> CallResult {
        match self.state {
            CallState::Done(result) => result,
            CallState::Waiting {
                call_id,
                replica,
                commands,
                ..
            } => {
                let _ = commands.send(Command::CancelCall { replica, call_id });
                Err(CallError::Cancelled)
            }
        }
    }
}

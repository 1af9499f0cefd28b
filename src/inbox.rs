//! Hand-off of control commands from listener tasks to the Controller.
//!
//! Each envelope carries its own reply slot, so a submitter always receives
//! the reply to its own command, after the Controller has applied it.

use crate::command::{ControlCommand, ControlReply};
use tokio::sync::{mpsc, oneshot};

const INBOX_CAPACITY: usize = 16;

pub struct Envelope {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<ControlReply>,
}

/// Controller side.
pub struct ConfigInbox {
    rx: mpsc::Receiver<Envelope>,
}

/// Listener side; cheap to clone per connection.
#[derive(Clone)]
pub struct InboxHandle {
    tx: mpsc::Sender<Envelope>,
}

pub fn config_inbox() -> (InboxHandle, ConfigInbox) {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    (InboxHandle { tx }, ConfigInbox { rx })
}

impl ConfigInbox {
    /// `None` once every handle is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// A command that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl InboxHandle {
    /// Queues the command and waits until the Controller has applied it.
    pub async fn submit(&self, command: ControlCommand) -> ControlReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            command,
            reply: reply_tx,
        };
        if self.tx.send(envelope).await.is_err() {
            return ControlReply::Error("monitor is shutting down".to_string());
        }
        reply_rx
            .await
            .unwrap_or_else(|_| ControlReply::Error("monitor exited before replying".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Applied;

    #[tokio::test]
    async fn test_submit_waits_for_reply() {
        let (handle, mut inbox) = config_inbox();
        let controller = tokio::spawn(async move {
            let env = inbox.recv().await.unwrap();
            assert_eq!(env.command.sample_rate, Some(10));
            let _ = env.reply.send(ControlReply::Applied(Applied {
                sample_rate: Some(10),
                ..Default::default()
            }));
        });

        let cmd = ControlCommand {
            sample_rate: Some(10),
            ..Default::default()
        };
        let reply = handle.submit(cmd).await;
        assert!(matches!(reply, ControlReply::Applied(a) if a.sample_rate == Some(10)));
        controller.await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_controller_gone() {
        let (handle, inbox) = config_inbox();
        drop(inbox);
        let reply = handle.submit(ControlCommand::status()).await;
        assert!(matches!(reply, ControlReply::Error(_)));
    }

    #[tokio::test]
    async fn test_try_recv_sees_queued_command() {
        let (handle, mut inbox) = config_inbox();
        assert!(inbox.try_recv().is_none());
        let submitter = tokio::spawn(async move { handle.submit(ControlCommand::status()).await });
        let env = inbox.recv().await.unwrap();
        assert_eq!(env.command.status, Some(true));
        drop(env);
        assert!(matches!(submitter.await.unwrap(), ControlReply::Error(_)));
    }

    #[tokio::test]
    async fn test_recv_none_when_handles_dropped() {
        let (handle, mut inbox) = config_inbox();
        drop(handle);
        assert!(inbox.recv().await.is_none());
    }
}

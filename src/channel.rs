//! Single-slot request/response handoff between the Controller and the Sampler.
//!
//! The request conduit holds at most one message. Snapshot replies travel over a
//! dedicated oneshot, so a reply can only ever answer the request that created it.

use crate::sampler::RateSnapshot;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChannelError {
    #[error("sampler is no longer running")]
    Closed,
}

#[derive(Debug)]
pub enum SamplerRequest {
    Snapshot(oneshot::Sender<RateSnapshot>),
    Stop,
    SetInterface(String),
    SetSampleRate(u32),
}

/// Controller side of the channel.
pub struct RateChannel {
    requests: mpsc::Sender<SamplerRequest>,
}

impl RateChannel {
    pub fn pair() -> (Self, mpsc::Receiver<SamplerRequest>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { requests: tx }, rx)
    }

    /// Blocks until the Sampler has published its aggregates after its next tick.
    ///
    /// Taking `&mut self` keeps a second snapshot from being issued while one is
    /// still outstanding.
    pub async fn snapshot(&mut self) -> Result<RateSnapshot, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(SamplerRequest::Snapshot(reply_tx)).await?;
        reply_rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Fire-and-forget; the Sampler exits after the tick that observes it.
    pub async fn stop(&self) -> Result<(), ChannelError> {
        self.send(SamplerRequest::Stop).await
    }

    pub async fn set_interface(&self, interface: &str) -> Result<(), ChannelError> {
        self.send(SamplerRequest::SetInterface(interface.to_string()))
            .await
    }

    pub async fn set_sample_rate(&self, sample_rate: u32) -> Result<(), ChannelError> {
        self.send(SamplerRequest::SetSampleRate(sample_rate)).await
    }

    async fn send(&self, request: SamplerRequest) -> Result<(), ChannelError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let (mut channel, mut rx) = RateChannel::pair();
        let responder = tokio::spawn(async move {
            match rx.recv().await {
                Some(SamplerRequest::Snapshot(reply)) => {
                    let _ = reply.send(RateSnapshot {
                        sample_count: 3,
                        ..Default::default()
                    });
                }
                other => panic!("unexpected request: {:?}", other),
            }
        });

        let snap = channel.snapshot().await.unwrap();
        assert_eq!(snap.sample_count, 3);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_after_sampler_gone() {
        let (mut channel, rx) = RateChannel::pair();
        drop(rx);
        assert_eq!(channel.snapshot().await, Err(ChannelError::Closed));
        assert_eq!(channel.stop().await, Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_dropped_reply_is_closed() {
        let (mut channel, mut rx) = RateChannel::pair();
        tokio::spawn(async move {
            // Receive and drop the reply slot without answering.
            let _ = rx.recv().await;
        });
        assert_eq!(channel.snapshot().await, Err(ChannelError::Closed));
    }
}

//! Latest-value-wins channel for continuous fader moves.
//!
//! `set_level` never queues: it overwrites a single pending slot and wakes a
//! dedicated worker task, which sends whatever the slot holds when it runs.

use std::sync::{Arc, Mutex, Weak};

use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    osc::{OscArg, OscMessage},
    protocol,
    transport::FrameSender,
};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingLevel {
    pub address: String,
    pub cue_id: String,
    pub level: f64,
}

struct Link {
    sender: FrameSender,
    workspace_id: String,
}

struct Inner {
    slot: Mutex<Option<PendingLevel>>,
    link: Mutex<Option<Link>>,
    wake: Arc<Notify>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct LevelChannel {
    inner: Arc<Inner>,
}

impl LevelChannel {
    /// Creates the channel and spawns its worker on the current runtime.
    pub fn spawn() -> Self {
        let wake = Arc::new(Notify::new());
        let inner = Arc::new(Inner {
            slot: Mutex::new(None),
            link: Mutex::new(None),
            wake: wake.clone(),
            worker: Mutex::new(None),
        });
        let worker = tokio::spawn(run_worker(Arc::downgrade(&inner), wake));
        if let Ok(mut slot) = inner.worker.lock() {
            *slot = Some(worker);
        }
        Self { inner }
    }

    /// Detaches and stops the worker task. Levels set afterwards are never
    /// sent.
    pub fn shutdown(&self) {
        self.detach();
        if let Some(worker) = self.inner.worker.lock().ok().and_then(|mut w| w.take()) {
            worker.abort();
            log::debug!("Level worker stopped.");
        }
    }

    /// Points the channel at a connected workspace.
    pub fn attach(&self, sender: FrameSender, workspace_id: &str) {
        if let Ok(mut link) = self.inner.link.lock() {
            *link = Some(Link {
                sender,
                workspace_id: workspace_id.to_string(),
            });
        }
    }

    /// Detaches from the transport and discards anything unsent.
    pub fn detach(&self) {
        if let Ok(mut link) = self.inner.link.lock() {
            *link = None;
        }
        self.cancel();
    }

    pub fn set_level(&self, cue_id: &str, level: f64) {
        let workspace_id = match self.inner.link.lock() {
            Ok(link) => match link.as_ref() {
                Some(link) => link.workspace_id.clone(),
                None => {
                    log::debug!("Dropping level for {}: not connected", cue_id);
                    return;
                }
            },
            Err(_) => return,
        };

        let pending = PendingLevel {
            address: protocol::slider_level_address(&workspace_id, cue_id),
            cue_id: cue_id.to_string(),
            level,
        };
        if let Ok(mut slot) = self.inner.slot.lock() {
            if slot.replace(pending).is_some() {
                log::trace!("Superseded unsent level");
            }
        }
        self.inner.wake.notify_one();
    }

    pub fn cancel(&self) {
        if let Ok(mut slot) = self.inner.slot.lock() {
            *slot = None;
        }
    }

    #[cfg(test)]
    fn pending(&self) -> Option<PendingLevel> {
        self.inner.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

async fn run_worker(inner: Weak<Inner>, wake: Arc<Notify>) {
    log::debug!("Level worker started.");
    loop {
        wake.notified().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let pending = inner.slot.lock().ok().and_then(|mut slot| slot.take());
        let sender = inner
            .link
            .lock()
            .ok()
            .and_then(|link| link.as_ref().map(|l| l.sender.clone()));
        drop(inner);

        let (Some(pending), Some(sender)) = (pending, sender) else {
            continue;
        };
        let message = OscMessage::new(pending.address).with_arg(OscArg::Float(pending.level as f32));
        if let Err(e) = sender.send(&message.encode()).await {
            log::error!("Failed to send level for {}: {:?}", pending.cue_id, e);
        }
    }
    log::debug!("Level worker finished.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{osc::decode_message, transport::FrameReceiver};
    use std::time::Duration;

    fn linked() -> (LevelChannel, FrameReceiver) {
        let (client, server) = tokio::io::duplex(1024);
        let channel = LevelChannel::spawn();
        channel.attach(FrameSender::stream(client), "W");
        (channel, FrameReceiver::stream(server))
    }

    async fn next_message(receiver: &mut FrameReceiver) -> Option<OscMessage> {
        let frame = tokio::time::timeout(Duration::from_millis(100), receiver.next_frame())
            .await
            .ok()?
            .ok()??;
        decode_message(&frame).ok()
    }

    #[tokio::test]
    async fn latest_value_wins() {
        let (channel, mut receiver) = linked();

        channel.set_level("C", -10.0);
        channel.set_level("C", -3.0);

        let message = next_message(&mut receiver).await.unwrap();
        assert_eq!(message.address, "/workspace/W/cue_id/C/sliderLevel/0");
        assert_eq!(message.args, vec![OscArg::Float(-3.0)]);
        assert!(next_message(&mut receiver).await.is_none());
    }

    #[tokio::test]
    async fn each_flush_sends_once() {
        let (channel, mut receiver) = linked();

        channel.set_level("C", 1.0);
        assert_eq!(next_message(&mut receiver).await.unwrap().args, vec![OscArg::Float(1.0)]);
        channel.set_level("D", 2.0);
        let message = next_message(&mut receiver).await.unwrap();
        assert_eq!(message.address, "/workspace/W/cue_id/D/sliderLevel/0");
        assert!(next_message(&mut receiver).await.is_none());
    }

    #[tokio::test]
    async fn cancel_discards_unsent_level() {
        let (channel, mut receiver) = linked();

        channel.set_level("C", -1.0);
        assert!(channel.pending().is_some());
        channel.cancel();
        assert!(channel.pending().is_none());
        assert!(next_message(&mut receiver).await.is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker() {
        let (channel, mut receiver) = linked();
        channel.shutdown();

        let (client, _server) = tokio::io::duplex(1024);
        channel.attach(FrameSender::stream(client), "W");
        channel.set_level("C", 1.0);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Nothing drains the slot any more.
        assert!(channel.pending().is_some());
        assert!(next_message(&mut receiver).await.is_none());
    }

    #[tokio::test]
    async fn unattached_channel_drops_levels() {
        let channel = LevelChannel::spawn();
        channel.set_level("C", 0.5);
        assert!(channel.pending().is_none());
    }
}

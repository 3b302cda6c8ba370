use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::mailer::{MailError, Mailer, Message};
use crate::model::{TableView, Update};

const CHANNEL_CAPACITY: usize = 256;
/// Messages waiting for a delivery slot. Beyond this they are dropped.
const OUTBOX_CAPACITY: usize = 1024;
const MAX_CONCURRENT_DELIVERIES: usize = 16;

/// Publish/subscribe channels for live floor-plan updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Every table's updates.
    Floor,
    /// A single table's updates.
    Table(Ulid),
}

/// Broadcast hub for `reservation:update` publications.
pub struct NotifyHub {
    channels: DashMap<Channel, broadcast::Sender<Update>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Update> {
        let sender = self
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a publication. No-op if nobody is listening.
    pub fn send(&self, channel: Channel, update: &Update) {
        if let Some(sender) = self.channels.get(&channel) {
            let _ = sender.send(update.clone());
        }
    }

    /// Publish a single table delta to the floor channel and that table's channel.
    pub fn send_table(&self, view: &TableView) {
        let update = Update::Table(view.clone());
        self.send(Channel::Floor, &update);
        self.send(Channel::Table(view.table.id), &update);
    }

    pub fn receiver_count(&self, channel: Channel) -> usize {
        self.channels
            .get(&channel)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Remove a channel (e.g. when its table is deleted).
    pub fn remove(&self, channel: Channel) {
        self.channels.remove(&channel);
    }
}

/// Fire-and-forget side effects of state transitions. Holder messages queue
/// in a bounded outbox and are delivered a few at a time, each under a
/// timeout; publications go straight to the hub. Neither can fail the
/// transition that triggered it.
pub struct Dispatcher {
    hub: Arc<NotifyHub>,
    outbox: mpsc::Sender<Message>,
    base_url: String,
}

impl Dispatcher {
    /// Must be called inside a tokio runtime: spawns the mail worker.
    pub fn new(hub: Arc<NotifyHub>, mailer: Arc<dyn Mailer>, base_url: String, timeout: Duration) -> Self {
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        tokio::spawn(mail_worker(rx, mailer, timeout));
        Self {
            hub,
            outbox,
            base_url,
        }
    }

    pub fn hub(&self) -> &Arc<NotifyHub> {
        &self.hub
    }

    /// `<base>/confirm/<token>`
    pub fn confirmation_url(&self, token: &str) -> String {
        format!("{}/confirm/{token}", self.base_url.trim_end_matches('/'))
    }

    pub fn send_message(&self, message: Message) {
        match self.outbox.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(to = %message.to, kind = ?message.kind, "mail outbox full, dropping message");
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            }
            Err(TrySendError::Closed(_)) => {
                warn!("mail worker stopped, dropping message");
                metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            }
        }
    }

    pub fn publish_table(&self, view: &TableView) {
        self.hub.send_table(view);
    }
}

/// Takes messages off the outbox and delivers each on its own task, with at
/// most [`MAX_CONCURRENT_DELIVERIES`] in flight. A hanging relay stalls
/// only its own slot.
async fn mail_worker(mut rx: mpsc::Receiver<Message>, mailer: Arc<dyn Mailer>, timeout: Duration) {
    let slots = Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES));
    while let Some(message) = rx.recv().await {
        let Ok(slot) = slots.clone().acquire_owned().await else {
            break;
        };
        let mailer = mailer.clone();
        tokio::spawn(async move {
            deliver(mailer.as_ref(), &message, timeout).await;
            drop(slot);
        });
    }
}

async fn deliver(mailer: &dyn Mailer, message: &Message, timeout: Duration) {
    let result = match tokio::time::timeout(timeout, mailer.send(message)).await {
        Ok(result) => result,
        Err(_) => Err(MailError::Timeout),
    };
    match result {
        Ok(()) => {
            debug!(to = %message.to, kind = ?message.kind, "message delivered");
            metrics::counter!(crate::observability::MESSAGES_SENT_TOTAL).increment(1);
        }
        Err(e) => {
            warn!(to = %message.to, kind = ?message.kind, "message delivery failed: {e}");
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
        }
    }
}

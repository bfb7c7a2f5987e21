use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, ProviderId};

const CHANNEL_CAPACITY: usize = 256;

/// Per-provider broadcast of ledger changes. The engine publishes after every
/// applied booking event; the wire layer turns subscriptions into
/// LISTEN/NOTIFY.
pub struct NotifyHub {
    channels: DashMap<ProviderId, broadcast::Sender<Event>>,
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

    /// Subscribe to changes on one provider. Creates the channel if needed.
    pub fn subscribe(&self, provider_id: ProviderId) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, provider_id: ProviderId, event: &Event) {
        if let Some(sender) = self.channels.get(&provider_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose last subscriber went away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// `provider_<ulid>` channel name for LISTEN.
pub fn channel_name(provider_id: ProviderId) -> String {
    format!("provider_{provider_id}")
}

/// Inverse of [`channel_name`].
pub fn parse_channel(channel: &str) -> Option<ProviderId> {
    channel
        .strip_prefix("provider_")
        .and_then(|id| ulid::Ulid::from_string(id).ok())
}

/// NOTIFY payload: the event as a JSON object.
pub fn payload(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Provider;
    use ulid::Ulid;

    fn provider_event(id: ProviderId) -> Event {
        Event::ProviderRegistered(Provider {
            id,
            owner_id: None,
            name: Some("Clinic".into()),
            open_time: None,
            close_time: None,
            slot_interval: None,
        })
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);

        let event = provider_event(pid);
        hub.send(pid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        hub.send(pid, &provider_event(pid));
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn other_provider_not_delivered() {
        let hub = NotifyHub::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut rx = hub.subscribe(a);
        hub.send(b, &provider_event(b));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn prune_drops_idle_channels() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let rx = hub.subscribe(pid);
        hub.prune();
        assert_eq!(hub.channel_count(), 1);
        drop(rx);
        hub.prune();
        assert_eq!(hub.channel_count(), 0);
    }

    #[test]
    fn channel_name_roundtrip() {
        let pid = Ulid::new();
        assert_eq!(parse_channel(&channel_name(pid)), Some(pid));
        assert_eq!(parse_channel("resource_abc"), None);
        assert_eq!(parse_channel("provider_not-a-ulid"), None);
    }

    #[test]
    fn payload_is_json_object() {
        let value: serde_json::Value =
            serde_json::from_str(&payload(&provider_event(Ulid::new()))).unwrap();
        assert!(value.is_object());
        assert!(value.get("ProviderRegistered").is_some());
    }
}

//! Multiplexed websocket with dynamic channel/product subscriptions.
//!
//! One socket carries every channel. The engine mutates a desired
//! `channel → {productID}` map at any time; a background task diffs the
//! desired map against what the connection is actually subscribed to and
//! sends `subscribe`/`unsubscribe` frames to close the gap. On
//! connection loss the task reconnects after the retry interval and
//! replays the whole desired map from scratch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::EngineError;
use crate::exchange::coinbase::data::{
    SubscribeMsg, TickerEventRes, UserEventRes, WsEnvelope,
};
use crate::exchange::coinbase::sign::sign_channel;
use crate::exchange::{OrderRecord, Ticker};
use crate::shutdown::StopToken;
use crate::topic::Topic;
use crate::utils::config::Config;
use crate::utils::parse_rfc3339;

/// The channel carrying ticker updates.
pub(crate) const CHANNEL_TICKER: &str = "ticker";
/// The channel carrying the user's own order updates.
pub(crate) const CHANNEL_USER: &str = "user";
/// The keepalive channel.
pub(crate) const CHANNEL_HEARTBEATS: &str = "heartbeats";

type ChannelMap = BTreeMap<String, BTreeSet<String>>;

/// The desired subscription state, mutable at any time.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    desired: Mutex<ChannelMap>,
    changed: Notify,
}

impl Subscriptions {
    /// Add products to a channel's desired set and wake the diff task.
    pub(crate) fn add(&self, channel: &str, product_ids: &[String]) {
        let mut desired = self.desired.lock().expect("subscription lock poisoned");
        let entry = desired.entry(channel.to_owned()).or_default();
        let before = entry.len();
        entry.extend(product_ids.iter().cloned());
        let changed = entry.len() != before || product_ids.is_empty() && before == 0;
        drop(desired);

        if changed {
            self.changed.notify_one();
        }
    }

    /// Remove products from a channel's desired set and wake the diff task.
    pub(crate) fn remove(&self, channel: &str, product_ids: &[String]) {
        let mut desired = self.desired.lock().expect("subscription lock poisoned");
        let mut changed = false;
        if let Some(entry) = desired.get_mut(channel) {
            for product_id in product_ids {
                changed |= entry.remove(product_id);
            }
        }
        drop(desired);

        if changed {
            self.changed.notify_one();
        }
    }

    fn snapshot(&self) -> ChannelMap {
        self.desired
            .lock()
            .expect("subscription lock poisoned")
            .clone()
    }
}

/// Fan-out endpoints the websocket publishes into.
#[derive(Debug, Default)]
pub(crate) struct WsTopics {
    tickers: DashMap<String, Arc<Topic<Ticker>>>,
    orders: Topic<OrderRecord>,
}

impl WsTopics {
    /// The ticker topic for a product, created on first use.
    pub(crate) fn tickers(&self, product_id: &str) -> Arc<Topic<Ticker>> {
        self.tickers
            .entry(product_id.to_owned())
            .or_insert_with(|| Arc::new(Topic::new()))
            .clone()
    }

    /// The single user-order topic.
    pub(crate) fn orders(&self) -> &Topic<OrderRecord> {
        &self.orders
    }
}

/// Reorders ticker frames by sequence number within a bounded allowance.
#[derive(Debug)]
struct SequenceGuard {
    next: Option<u64>,
    buffered: BTreeMap<u64, WsEnvelope>,
    allowance: u64,
}

impl SequenceGuard {
    fn new(allowance: u64) -> Self {
        Self {
            next: None,
            buffered: BTreeMap::new(),
            allowance,
        }
    }

    /// Accept a frame; returns frames now deliverable in order.
    ///
    /// # Errors
    ///
    /// Will return [`EngineError::Transient`] when the gap ran past the
    /// allowance; the caller must reset the connection.
    fn accept(&mut self, envelope: WsEnvelope) -> Result<Vec<WsEnvelope>, EngineError> {
        let sequence = envelope.sequence_num;
        let Some(expected) = self.next else {
            self.next = Some(sequence + 1);
            return Ok(vec![envelope]);
        };

        if sequence < expected {
            // Stale duplicate.
            return Ok(Vec::new());
        }

        if sequence == expected {
            let mut out = vec![envelope];
            let mut next = expected + 1;
            while let Some(buffered) = self.buffered.remove(&next) {
                out.push(buffered);
                next += 1;
            }
            self.next = Some(next);
            return Ok(out);
        }

        if sequence - expected > self.allowance {
            return Err(EngineError::transient(format!(
                "sequence gap {expected}..{sequence} exceeds allowance {}",
                self.allowance
            )));
        }
        self.buffered.insert(sequence, envelope);

        Ok(Vec::new())
    }
}

/// Spawn the websocket maintenance task.
pub(crate) fn spawn(
    config: &Config,
    api_key: String,
    secret_key: String,
    subscriptions: Arc<Subscriptions>,
    topics: Arc<WsTopics>,
    stop: StopToken,
) -> JoinHandle<()> {
    let url = config.websocket_url();
    let retry_interval = config.websocket_retry_interval;
    let allowance = config.max_websocket_out_of_order_allowance;

    tokio::spawn(async move {
        loop {
            if stop.is_stopped() {
                return;
            }

            let stream = tokio::select! {
                () = stop.stopped() => return,
                connected = connect_async(url.as_str()) => match connected {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        log::warn!("Websocket connect to {url} failed: {err}");
                        tokio::select! {
                            () = stop.stopped() => return,
                            () = tokio::time::sleep(retry_interval) => continue,
                        }
                    }
                },
            };
            log::info!("Websocket handshake has been successfully completed.");

            let result = run_connection(
                stream,
                &api_key,
                &secret_key,
                &subscriptions,
                &topics,
                &stop,
                allowance,
            )
            .await;

            if stop.is_stopped() {
                return;
            }
            if let Err(err) = result {
                log::warn!("Websocket connection lost: {err}");
            }

            tokio::select! {
                () = stop.stopped() => return,
                () = tokio::time::sleep(retry_interval) => {}
            }
        }
    })
}

async fn run_connection(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    api_key: &str,
    secret_key: &str,
    subscriptions: &Subscriptions,
    topics: &WsTopics,
    stop: &StopToken,
    allowance: u64,
) -> Result<(), EngineError> {
    let (mut write, mut read) = stream.split();

    // Every connection starts from nothing subscribed.
    let mut active = ChannelMap::new();
    let mut guards: HashMap<String, SequenceGuard> = HashMap::new();

    reconcile_subscriptions(
        &mut write,
        api_key,
        secret_key,
        &mut active,
        subscriptions.snapshot(),
    )
    .await?;

    loop {
        tokio::select! {
            () = stop.stopped() => return Ok(()),
            () = subscriptions.changed.notified() => {
                reconcile_subscriptions(
                    &mut write,
                    api_key,
                    secret_key,
                    &mut active,
                    subscriptions.snapshot(),
                )
                .await?;
            }
            message = read.next() => {
                let Some(message) = message else {
                    return Err(EngineError::transient("websocket closed by the server"));
                };
                match message? {
                    Message::Text(text) => {
                        process_frame(&text, topics, &mut guards, allowance)?;
                    }
                    Message::Binary(raw) => {
                        let text = String::from_utf8(raw).map_err(|err| {
                            EngineError::transient(format!("binary frame is not utf-8: {err}"))
                        })?;
                        process_frame(&text, topics, &mut guards, allowance)?;
                    }
                    Message::Ping(payload) => {
                        write.send(Message::Pong(payload)).await?;
                    }
                    Message::Close(frame) => {
                        return Err(EngineError::transient(format!(
                            "websocket close frame: {frame:?}"
                        )));
                    }
                    message => {
                        log::warn!("Unsupported message recieved. {:#?}", &message);
                    }
                }
            }
        }
    }
}

async fn reconcile_subscriptions<S>(
    write: &mut S,
    api_key: &str,
    secret_key: &str,
    active: &mut ChannelMap,
    desired: ChannelMap,
) -> Result<(), EngineError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let mut frames = Vec::new();

    for (channel, wanted) in &desired {
        // A channel with an empty product list (heartbeats) still needs
        // one subscribe frame when it first appears.
        let newly_active = !active.contains_key(channel);
        let current = active.entry(channel.clone()).or_default();
        let to_subscribe: Vec<String> = wanted.difference(current).cloned().collect();
        let to_unsubscribe: Vec<String> = current.difference(wanted).cloned().collect();

        if !to_subscribe.is_empty() || (newly_active && wanted.is_empty()) {
            frames.push(subscribe_msg(
                "subscribe",
                channel,
                to_subscribe.clone(),
                api_key,
                secret_key,
            ));
        }
        if !to_unsubscribe.is_empty() {
            frames.push(subscribe_msg(
                "unsubscribe",
                channel,
                to_unsubscribe,
                api_key,
                secret_key,
            ));
        }

        *current = wanted.clone();
    }

    for frame in frames {
        let raw = serde_json::to_string(&frame)?;
        log::debug!("Sending {} for {}", frame.kind, frame.channel);
        write.send(Message::Text(raw)).await?;
    }

    Ok(())
}

fn subscribe_msg(
    kind: &str,
    channel: &str,
    product_ids: Vec<String>,
    api_key: &str,
    secret_key: &str,
) -> SubscribeMsg {
    let timestamp = Utc::now().timestamp();
    let signature = sign_channel(secret_key, timestamp, channel, &product_ids);

    SubscribeMsg {
        kind: kind.to_owned(),
        channel: channel.to_owned(),
        product_ids,
        api_key: api_key.to_owned(),
        timestamp: timestamp.to_string(),
        signature,
    }
}

fn process_frame(
    text: &str,
    topics: &WsTopics,
    guards: &mut HashMap<String, SequenceGuard>,
    allowance: u64,
) -> Result<(), EngineError> {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("Skipping malformed websocket frame: {err}");
            return Ok(());
        }
    };

    match envelope.channel.as_str() {
        CHANNEL_TICKER => {
            // Out-of-order ticker frames are buffered; a gap beyond the
            // allowance resets the connection.
            let guard = guards
                .entry(CHANNEL_TICKER.to_owned())
                .or_insert_with(|| SequenceGuard::new(allowance));
            for ready in guard.accept(envelope)? {
                publish_tickers(topics, &ready);
            }
        }
        CHANNEL_USER => {
            // Order events are never dropped for ordering reasons; gaps
            // are recovered by the REST poller.
            publish_orders(topics, &envelope);
        }
        CHANNEL_HEARTBEATS | "subscriptions" => {}
        other => {
            log::debug!("Ignoring message on unhandled channel {other:?}");
        }
    }

    Ok(())
}

fn publish_tickers(topics: &WsTopics, envelope: &WsEnvelope) {
    let time = envelope
        .timestamp
        .as_deref()
        .and_then(|raw| parse_rfc3339(raw).ok())
        .unwrap_or_else(Utc::now);

    for event in &envelope.events {
        let event: TickerEventRes = match serde_json::from_value(event.clone()) {
            Ok(event) => event,
            Err(err) => {
                log::warn!("Skipping malformed ticker event: {err}");
                continue;
            }
        };

        for raw in event.tickers {
            let topic = topics.tickers(&raw.product_id);
            topic.publish(raw.into_ticker(time));
        }
    }
}

fn publish_orders(topics: &WsTopics, envelope: &WsEnvelope) {
    for event in &envelope.events {
        let event: UserEventRes = match serde_json::from_value(event.clone()) {
            Ok(event) => event,
            Err(err) => {
                log::warn!("Skipping malformed user event: {err}");
                continue;
            }
        };

        for raw in event.orders {
            match OrderRecord::try_from(raw) {
                Ok(order) => topics.orders().publish(order),
                Err(err) => log::warn!("Skipping malformed order update: {err}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(sequence: u64) -> WsEnvelope {
        WsEnvelope {
            channel: CHANNEL_TICKER.to_owned(),
            sequence_num: sequence,
            timestamp: None,
            events: Vec::new(),
        }
    }

    #[test]
    fn in_order_frames_pass_through() {
        let mut guard = SequenceGuard::new(100);
        assert_eq!(guard.accept(envelope(1)).unwrap().len(), 1);
        assert_eq!(guard.accept(envelope(2)).unwrap().len(), 1);
        assert_eq!(guard.accept(envelope(3)).unwrap().len(), 1);
    }

    #[test]
    fn gap_buffers_until_closed() {
        let mut guard = SequenceGuard::new(100);
        assert_eq!(guard.accept(envelope(1)).unwrap().len(), 1);

        // 3 and 4 arrive before 2.
        assert!(guard.accept(envelope(3)).unwrap().is_empty());
        assert!(guard.accept(envelope(4)).unwrap().is_empty());

        let released = guard.accept(envelope(2)).unwrap();
        let sequences: Vec<u64> = released.iter().map(|e| e.sequence_num).collect();
        assert_eq!(sequences, vec![2, 3, 4]);

        assert_eq!(guard.accept(envelope(5)).unwrap().len(), 1);
    }

    #[test]
    fn stale_duplicates_are_dropped() {
        let mut guard = SequenceGuard::new(100);
        assert_eq!(guard.accept(envelope(1)).unwrap().len(), 1);
        assert_eq!(guard.accept(envelope(2)).unwrap().len(), 1);
        assert!(guard.accept(envelope(1)).unwrap().is_empty());
    }

    #[test]
    fn runaway_gap_resets_the_stream() {
        let mut guard = SequenceGuard::new(3);
        assert_eq!(guard.accept(envelope(1)).unwrap().len(), 1);
        assert!(guard.accept(envelope(3)).unwrap().is_empty());
        assert!(guard.accept(envelope(6)).is_err());
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fan out incoming publishes to registered topic-filter receivers.

use std::collections::HashMap;
use std::str::FromStr;
use std::string::FromUtf8Error;

use thiserror::Error;
use tokio::sync::mpsc::{channel, error::SendError, Receiver, Sender};

use crate::control_packet::Publish;
use crate::topic::{TopicFilter, TopicName, TopicParseError};

/// Error dispatching an incoming publish to its registered receivers.
///
/// These should almost never occur: closed receivers are pruned before dispatch, and publishes
/// received from a conformant broker always carry a valid topic name.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("receiver closed")]
    ClosedReceiver(#[from] SendError<Publish>),
    #[error("invalid topic on incoming publish: {0}")]
    InvalidPublish(#[from] InvalidPublish),
}

/// Reason an incoming publish's topic could not be used for dispatch.
#[derive(Error, Debug)]
pub enum InvalidPublish {
    #[error("topic is not valid UTF-8")]
    TopicUtf8(#[from] FromUtf8Error),
    #[error("invalid topic: {0}")]
    TopicFormat(#[from] TopicParseError),
}

/// Dispatches incoming publishes to receivers registered against topic filters.
///
/// A publish is sent to every registered filter whose pattern matches its topic name. Most
/// deployments register exactly one filter per topic, in which case each publish reaches exactly
/// one receiver and that receiver alone is responsible for acking it. If overlapping filters are
/// registered, a publish may be dispatched more than once; the ordered acker's duplicate-pending
/// check means only the first receiver to actually ack a given publish succeeds, so the rest can
/// treat `AckErrorKind::AlreadyAcked` as "someone else already handled it".
pub struct IncomingPublishDispatcher {
    channel_capacity: usize,
    filtered_txs: HashMap<TopicFilter, Vec<Sender<Publish>>>,
    unfiltered_tx: Sender<Publish>,
}

impl IncomingPublishDispatcher {
    /// Create a new dispatcher along with the receiver for publishes matching no registered
    /// filter.
    pub fn new(capacity: usize) -> (Self, Receiver<Publish>) {
        let (tx, rx) = channel(capacity);
        (
            Self {
                channel_capacity: capacity,
                filtered_txs: HashMap::new(),
                unfiltered_tx: tx,
            },
            rx,
        )
    }

    /// Register a topic filter for dispatching, returning a receiver for publishes that match it.
    pub fn register_filter(&mut self, topic_filter: &TopicFilter) -> Receiver<Publish> {
        self.prune();
        let (tx, rx) = channel(self.channel_capacity);
        self.filtered_txs
            .entry(topic_filter.clone())
            .or_default()
            .push(tx);
        rx
    }

    /// Snapshot the live senders a publish would be dispatched to, without sending anything.
    ///
    /// Lets a caller holding this dispatcher behind a short-lived lock (e.g. a [`Session`]'s
    /// event loop) release that lock before awaiting the sends themselves.
    ///
    /// # Errors
    /// Returns [`InvalidPublish`] if the publish's topic name is malformed.
    pub fn matching_senders(&self, publish: &Publish) -> Result<Vec<Sender<Publish>>, InvalidPublish> {
        let topic_name = extract_topic_name(publish)?;
        let mut senders: Vec<Sender<Publish>> = self
            .filtered_txs
            .iter()
            .filter(|(filter, _)| filter.matches_topic_name(topic_name.as_str()))
            .flat_map(|(_, txs)| txs.iter().filter(|tx| !tx.is_closed()).cloned())
            .collect();
        if senders.is_empty() {
            senders.push(self.unfiltered_tx.clone());
        }
        Ok(senders)
    }

    /// Dispatch a publish to every registered filter matching its topic name, falling back to the
    /// unfiltered receiver if none match. Returns the number of receivers reached.
    ///
    /// # Errors
    /// Returns a [`DispatchError`] if the topic name is malformed, or if every matching channel
    /// (or the unfiltered fallback) has been closed.
    pub async fn dispatch_publish(&mut self, publish: Publish) -> Result<usize, DispatchError> {
        let mut num_dispatches = 0;
        let mut closed = Vec::new();

        let topic_name = extract_topic_name(&publish)?;

        let filtered = self
            .filtered_txs
            .iter()
            .filter(|(filter, _)| filter.matches_topic_name(topic_name.as_str()));
        for (filter, txs) in filtered {
            for (pos, tx) in txs.iter().enumerate() {
                if tx.is_closed() {
                    closed.push((filter.clone(), pos));
                    continue;
                }
                tx.send(publish.clone()).await?;
                num_dispatches += 1;
            }
        }

        if num_dispatches == 0 {
            self.unfiltered_tx.send(publish).await?;
            num_dispatches += 1;
        }

        for (filter, pos) in closed.into_iter().rev() {
            if let Some(txs) = self.filtered_txs.get_mut(&filter) {
                txs.remove(pos);
                if txs.is_empty() {
                    self.filtered_txs.remove(&filter);
                }
            }
        }

        Ok(num_dispatches)
    }

    /// Drop any closed filter receivers. Called automatically on every `register_filter`.
    fn prune(&mut self) {
        self.filtered_txs.retain(|_, txs| {
            txs.retain(|tx| !tx.is_closed());
            !txs.is_empty()
        });
    }
}

fn extract_topic_name(publish: &Publish) -> Result<TopicName, InvalidPublish> {
    let topic = String::from_utf8(publish.topic.to_vec())?;
    Ok(TopicName::from_str(&topic)?)
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;
    use crate::control_packet::QoS;

    fn publish(topic: &str, payload: &str) -> Publish {
        Publish::new(topic, QoS::AtLeastOnce, payload.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn unmatched_publish_goes_to_unfiltered_receiver() {
        let (mut dispatcher, mut unfiltered_rx) = IncomingPublishDispatcher::new(10);
        let p = publish("sport/tennis/player1", "payload");
        assert_eq!(dispatcher.dispatch_publish(p.clone()).await.unwrap(), 1);
        assert_eq!(unfiltered_rx.try_recv().unwrap(), p);
    }

    #[tokio::test]
    async fn matching_filter_receives_and_unfiltered_does_not() {
        let (mut dispatcher, mut unfiltered_rx) = IncomingPublishDispatcher::new(10);
        let filter = TopicFilter::from_str("sport/+/player1").unwrap();
        let mut rx = dispatcher.register_filter(&filter);

        let p = publish("sport/tennis/player1", "payload");
        assert_eq!(dispatcher.dispatch_publish(p.clone()).await.unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), p);
        assert_eq!(unfiltered_rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_register() {
        let (mut dispatcher, _unfiltered_rx) = IncomingPublishDispatcher::new(10);
        let filter = TopicFilter::from_str("a/b").unwrap();
        let rx = dispatcher.register_filter(&filter);
        drop(rx);

        let other = TopicFilter::from_str("c/d").unwrap();
        dispatcher.register_filter(&other);

        assert!(!dispatcher.filtered_txs.contains_key(&filter));
    }

    #[tokio::test]
    async fn overlapping_filters_each_get_a_copy() {
        let (mut dispatcher, _unfiltered_rx) = IncomingPublishDispatcher::new(10);
        let exact = TopicFilter::from_str("sport/tennis/player1").unwrap();
        let wildcard = TopicFilter::from_str("sport/#").unwrap();
        let mut exact_rx = dispatcher.register_filter(&exact);
        let mut wildcard_rx = dispatcher.register_filter(&wildcard);

        let p = publish("sport/tennis/player1", "payload");
        assert_eq!(dispatcher.dispatch_publish(p.clone()).await.unwrap(), 2);
        assert_eq!(exact_rx.try_recv().unwrap(), p);
        assert_eq!(wildcard_rx.try_recv().unwrap(), p);
    }
}

//! Outbox of domain events.
//!
//! The engine publishes every state change it makes here. Consumers
//! (notifications, persistence writers, logs) subscribe independently and
//! never call back into the engine.
//!
//! Uses a tokio broadcast channel for fan-out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::RejectionReason;
use crate::models::{Bias, ConfluenceStage, Direction, ExitReason, Outcome, SwingType, TradeId};

/// Something the engine did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DomainEvent {
    SweepDetected {
        sweep_id: u64,
        sweep_type: SwingType,
        bias: Bias,
        price: f64,
        swing_price: f64,
    },

    ConfluenceAdvanced {
        confluence_id: u64,
        sweep_id: u64,
        from: ConfluenceStage,
        to: ConfluenceStage,
    },

    ConfluenceExpired {
        confluence_id: u64,
        sweep_id: u64,
    },

    TradeOpened {
        trade_id: TradeId,
        confluence_id: u64,
        direction: Direction,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        position_size: f64,
    },

    TradeRejected {
        confluence_id: u64,
        reasons: Vec<String>,
    },

    /// Stop moved to entry
    StopAdjusted {
        trade_id: TradeId,
        stop_loss: f64,
    },

    TradeClosed {
        trade_id: TradeId,
        exit_reason: ExitReason,
        outcome: Outcome,
        exit_price: f64,
        pnl: f64,
    },
}

impl DomainEvent {
    pub fn trade_rejected(confluence_id: u64, reasons: &[RejectionReason]) -> Self {
        DomainEvent::TradeRejected {
            confluence_id,
            reasons: reasons.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// An event with its outbox envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event: DomainEvent,
}

/// Fan-out channel for domain events.
///
/// Sending never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers lag rather than stall the engine.
#[derive(Clone)]
pub struct Outbox {
    sender: broadcast::Sender<OutboxEvent>,
}

impl Outbox {
    /// Create an outbox buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; returns how many subscribers got it.
    pub fn publish(&self, event: DomainEvent, occurred_at: DateTime<Utc>) -> usize {
        let envelope = OutboxEvent {
            id: Uuid::new_v4(),
            occurred_at,
            event,
        };
        // send() returns Err if there are no receivers, but we don't care
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> OutboxReceiver {
        OutboxReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(1000)
    }
}

pub struct OutboxReceiver {
    receiver: broadcast::Receiver<OutboxEvent>,
}

impl OutboxReceiver {
    /// Next event.
    ///
    /// Returns `None` once the outbox is dropped, and an error description
    /// if this receiver lagged and missed events.
    pub async fn recv(&mut self) -> Option<Result<OutboxEvent, String>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is waiting.
    pub fn try_recv(&mut self) -> Option<Result<OutboxEvent, String>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(broadcast::error::TryRecvError::Closed) => None,
            Err(broadcast::error::TryRecvError::Lagged(count)) => {
                Some(Err(format!("Receiver lagged, missed {} events", count)))
            }
        }
    }

    /// Everything currently buffered, skipping lag notices
    pub fn drain(&mut self) -> Vec<OutboxEvent> {
        let mut events = Vec::new();
        while let Some(next) = self.try_recv() {
            if let Ok(event) = next {
                events.push(event);
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expired(id: u64) -> DomainEvent {
        DomainEvent::ConfluenceExpired {
            confluence_id: id,
            sweep_id: 1,
        }
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let outbox = Outbox::new(10);
        let mut rx = outbox.subscribe();

        let delivered = outbox.publish(expired(7), Utc::now());
        assert_eq!(delivered, 1);

        let event = rx.recv().await.unwrap().unwrap();
        assert_eq!(event.event, expired(7));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let outbox = Outbox::default();
        assert_eq!(outbox.publish(expired(1), Utc::now()), 0);
    }

    #[test]
    fn test_each_event_gets_unique_id() {
        let outbox = Outbox::new(10);
        let mut rx = outbox.subscribe();

        outbox.publish(expired(1), Utc::now());
        outbox.publish(expired(2), Utc::now());

        let events = rx.drain();
        assert_eq!(events.len(), 2);
        assert_ne!(events[0].id, events[1].id);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_lagged_receiver_reports_missed() {
        let outbox = Outbox::new(2);
        let mut rx = outbox.subscribe();

        for id in 0..5 {
            outbox.publish(expired(id), Utc::now());
        }

        let first = rx.try_recv().unwrap();
        assert!(first.unwrap_err().contains("missed 3"));
    }

    #[test]
    fn test_rejection_reasons_rendered() {
        let event = DomainEvent::trade_rejected(3, &[RejectionReason::ZeroStopDistance]);
        match event {
            DomainEvent::TradeRejected { confluence_id, reasons } => {
                assert_eq!(confluence_id, 3);
                assert_eq!(reasons, vec!["entry and stop are identical".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

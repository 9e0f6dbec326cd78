use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::call::errors::CallError;
use crate::call::events::{CallEvent, EventBus};
use crate::call::registry::{Call, InFlight, SessionRegistry};
use crate::call::types::{ExchangeKind, NegotiationExchange, NegotiationMessage};
use crate::log::log_sink::LogSink;
use crate::{sink_debug, sink_trace, sink_warn};

/// What happened to a submitted negotiation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered {
        exchange: NegotiationExchange,
        /// The in-flight request this answer completed, if any.
        completed: Option<NegotiationExchange>,
    },
    /// The destination already left the call; nothing was delivered.
    Dropped,
}

/// Routes negotiation messages between members of the same call.
///
/// Delivery is at-most-once and happens while the call is locked, so
/// exchanges within one call reach subscribers in submission order.
pub struct SignalingRelay {
    registry: Arc<SessionRegistry>,
    bus: EventBus,
    next_exchange_id: AtomicU64,
    exchange_timeout: Duration,
    relay_endpoint: Option<String>,
    log: Arc<dyn LogSink>,
}

impl SignalingRelay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bus: EventBus,
        exchange_timeout: Duration,
        relay_endpoint: Option<String>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            registry,
            bus,
            next_exchange_id: AtomicU64::new(1),
            exchange_timeout,
            relay_endpoint,
            log,
        }
    }

    /// Endpoint routable in every call besides the members themselves.
    pub fn relay_endpoint(&self) -> Option<&str> {
        self.relay_endpoint.as_deref()
    }

    pub fn send(&self, msg: NegotiationMessage, now: Instant) -> Result<Delivery, CallError> {
        let call_id = msg.call_id.clone();
        self.registry
            .with_call(&call_id, |call| self.send_in(call, msg, now))?
    }

    /// Drops every in-flight exchange that names `participant_id` as sender
    /// or destination.
    pub fn cancel_pending(
        &self,
        call_id: &str,
        participant_id: &str,
    ) -> Result<Vec<NegotiationExchange>, CallError> {
        match self
            .registry
            .with_call(call_id, |call| self.cancel_pending_in(call, participant_id))
        {
            Err(CallError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    fn is_endpoint(&self, call: &Call, id: &str) -> bool {
        call.is_member(id) || self.relay_endpoint.as_deref() == Some(id)
    }

    pub(crate) fn send_in(
        &self,
        call: &mut Call,
        msg: NegotiationMessage,
        now: Instant,
    ) -> Result<Delivery, CallError> {
        if msg.from == msg.to || !self.is_endpoint(call, &msg.from) {
            return Err(CallError::InvalidRoute {
                from: msg.from,
                to: msg.to,
            });
        }
        if !self.is_endpoint(call, &msg.to) {
            if call.has_departed(&msg.to) {
                sink_warn!(
                    self.log,
                    "dropping {:?} from {} to departed participant {} in call {}",
                    msg.kind,
                    msg.from,
                    msg.to,
                    call.call_id
                );
                return Ok(Delivery::Dropped);
            }
            return Err(CallError::InvalidRoute {
                from: msg.from,
                to: msg.to,
            });
        }

        let exchange = NegotiationExchange {
            exchange_id: self.next_exchange_id.fetch_add(1, Ordering::Relaxed),
            call_id: msg.call_id,
            from: msg.from,
            to: msg.to,
            kind: msg.kind,
            in_reply_to: msg.in_reply_to,
            payload: msg.payload,
        };

        let completed = if exchange.kind == ExchangeKind::Answer {
            take_matching_request(call, &exchange)
        } else {
            None
        };

        if exchange.kind.awaits_answer() {
            call.inflight.push_back(InFlight {
                exchange: exchange.clone(),
                deadline: now + self.exchange_timeout,
            });
        }

        sink_trace!(
            self.log,
            "relaying exchange {} {:?} {} -> {} in call {}",
            exchange.exchange_id,
            exchange.kind,
            exchange.from,
            exchange.to,
            exchange.call_id
        );
        self.bus
            .publish(CallEvent::NegotiationMessage(exchange.clone()));

        Ok(Delivery::Delivered {
            exchange,
            completed,
        })
    }

    pub(crate) fn cancel_pending_in(
        &self,
        call: &mut Call,
        participant_id: &str,
    ) -> Vec<NegotiationExchange> {
        let cancelled = self.cancel_where(call, |e| e.involves(participant_id));
        if !cancelled.is_empty() {
            sink_debug!(
                self.log,
                "cancelled {} pending exchanges of {} in call {}",
                cancelled.len(),
                participant_id,
                call.call_id
            );
        }
        cancelled
    }

    pub(crate) fn cancel_where<P>(&self, call: &mut Call, mut pred: P) -> Vec<NegotiationExchange>
    where
        P: FnMut(&NegotiationExchange) -> bool,
    {
        let mut cancelled = Vec::new();
        call.inflight.retain(|f| {
            if pred(&f.exchange) {
                cancelled.push(f.exchange.clone());
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Drops in-flight requests whose answer never came.
    pub(crate) fn expire_in(&self, call: &mut Call, now: Instant) -> Vec<NegotiationExchange> {
        let expired: Vec<NegotiationExchange> = call
            .inflight
            .iter()
            .filter(|f| f.deadline <= now)
            .map(|f| f.exchange.clone())
            .collect();
        call.inflight.retain(|f| f.deadline > now);
        for e in &expired {
            sink_debug!(
                self.log,
                "exchange {} {:?} {} -> {} in call {} expired unanswered",
                e.exchange_id,
                e.kind,
                e.from,
                e.to,
                e.call_id
            );
        }
        expired
    }
}

/// Removes and returns the request `answer` completes: the one it names in
/// `in_reply_to`, else the oldest request travelling the opposite way.
fn take_matching_request(call: &mut Call, answer: &NegotiationExchange) -> Option<NegotiationExchange> {
    let pos = call.inflight.iter().position(|f| {
        let req = &f.exchange;
        req.kind.awaits_answer()
            && req.from == answer.to
            && req.to == answer.from
            && answer.in_reply_to.is_none_or(|id| id == req.exchange_id)
    })?;
    call.inflight.remove(pos).map(|f| f.exchange)
}

use std::time::{Duration, Instant};

use crate::message::{IncomingResponse, OutgoingRequest, ResponseClass};
use crate::timers::{self, TimerSlot, Timers};
use crate::transport::Transport;

use super::{stamp_via, TransactionEvent, TransactionState};

/// Non-INVITE client transaction: TRYING, PROCEEDING, COMPLETED, TERMINATED.
#[derive(Debug)]
pub struct NonInviteClientTransaction {
    id: String,
    request: OutgoingRequest,
    state: TransactionState,
    timers: Timers,
    timer_e: TimerSlot,
    e_interval: Duration,
    timer_f: TimerSlot,
    timer_k: TimerSlot,
}

impl NonInviteClientTransaction {
    pub fn new(mut request: OutgoingRequest, branch: String, transport: &dyn Transport, via_host: &str) -> Self {
        stamp_via(&mut request, transport, via_host, &branch);
        Self {
            id: branch,
            request,
            state: TransactionState::Trying,
            timers: Timers::for_transport(transport.is_reliable()),
            timer_e: TimerSlot::default(),
            e_interval: timers::T1,
            timer_f: TimerSlot::default(),
            timer_k: TimerSlot::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn request(&self) -> &OutgoingRequest {
        &self.request
    }

    pub fn send(&mut self, transport: &mut dyn Transport, now: Instant) -> Option<TransactionEvent> {
        self.timer_f.arm(now, timers::TIMER_F);
        if self.timers.retransmit {
            self.timer_e.arm(now, self.e_interval);
        }
        if !transport.send(&self.request.to_string()) {
            return Some(self.transport_error());
        }
        None
    }

    pub fn receive_response(&mut self, response: IncomingResponse, now: Instant) -> Option<TransactionEvent> {
        match (response.class(), self.state) {
            (ResponseClass::Provisional, TransactionState::Trying | TransactionState::Proceeding) => {
                self.state = TransactionState::Proceeding;
                Some(TransactionEvent::Response(response))
            }
            (ResponseClass::Provisional, _) => None,
            (_, TransactionState::Trying | TransactionState::Proceeding) => {
                self.state = TransactionState::Completed;
                self.timer_e.cancel();
                self.timer_f.cancel();
                self.timer_k.arm(now, self.timers.k);
                if response.status_code == 408 {
                    Some(TransactionEvent::RequestTimeout)
                } else {
                    Some(TransactionEvent::Response(response))
                }
            }
            // Retransmitted finals are absorbed.
            _ => None,
        }
    }

    pub fn on_timer(&mut self, transport: &mut dyn Transport, now: Instant) -> Option<TransactionEvent> {
        let active = matches!(self.state, TransactionState::Trying | TransactionState::Proceeding);

        if self.timer_f.fire(now) && active {
            log::debug!("Timer F expired for non-INVITE client transaction {}", self.id);
            self.terminate();
            return Some(TransactionEvent::RequestTimeout);
        }

        if self.timer_e.fire(now) && active {
            self.e_interval = match self.state {
                TransactionState::Trying => (self.e_interval * 2).min(timers::T2),
                _ => timers::T2,
            };
            if !transport.send(&self.request.to_string()) {
                return Some(self.transport_error());
            }
            self.timer_e.arm(now, self.e_interval);
        }

        if self.timer_k.fire(now) && self.state == TransactionState::Completed {
            self.terminate();
        }
        None
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        timers::earliest([
            self.timer_e.deadline(),
            self.timer_f.deadline(),
            self.timer_k.deadline(),
        ])
    }

    fn transport_error(&mut self) -> TransactionEvent {
        log::debug!("transport error occurred, deleting transaction {}", self.id);
        self.terminate();
        TransactionEvent::TransportError
    }

    fn terminate(&mut self) {
        self.state = TransactionState::Terminated;
        self.timer_e.cancel();
        self.timer_f.cancel();
        self.timer_k.cancel();
    }
}

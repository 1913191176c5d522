use std::time::{Duration, Instant};

use crate::dialog::SipDialogId;
use crate::message::{IncomingRequest, Reply, ResponseClass};
use crate::timers::{self, TimerSlot, Timers};
use crate::transport::Transport;
use crate::{Result, SipError};

use super::TransactionState;

/// INVITE server transaction: PROCEEDING, ACCEPTED, COMPLETED, CONFIRMED,
/// TERMINATED. A 100 Trying goes out as soon as it is created.
#[derive(Debug)]
pub struct InviteServerTransaction {
    state: TransactionState,
    last_response: Option<String>,
    last_status: Option<u16>,
    timers: Timers,
    resend_provisional: TimerSlot,
    timer_g: TimerSlot,
    g_interval: Duration,
    timer_h: TimerSlot,
    timer_i: TimerSlot,
    timer_l: TimerSlot,
    pub(crate) dialog: Option<SipDialogId>,
}

impl InviteServerTransaction {
    pub fn new(request: &mut IncomingRequest, transport: &mut dyn Transport, session_timers: bool, now: Instant) -> Self {
        let mut tr = Self {
            state: TransactionState::Proceeding,
            last_response: None,
            last_status: None,
            timers: Timers::for_transport(transport.is_reliable()),
            resend_provisional: TimerSlot::default(),
            timer_g: TimerSlot::default(),
            g_interval: timers::T1,
            timer_h: TimerSlot::default(),
            timer_i: TimerSlot::default(),
            timer_l: TimerSlot::default(),
            dialog: None,
        };
        match request.build_response(&Reply::new(100), session_timers) {
            Ok(trying) => {
                if let Err(err) = tr.receive_response(100, trying, transport, now) {
                    log::warn!("failed to send 100 Trying: {}", err);
                }
            }
            Err(err) => log::warn!("cannot build 100 Trying: {}", err),
        }
        tr
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn last_response(&self) -> Option<&str> {
        self.last_response.as_deref()
    }

    pub fn last_status(&self) -> Option<u16> {
        self.last_status
    }

    /// Sends a response produced by the core. `Ok(false)` means the state no
    /// longer accepts this response and nothing was sent.
    pub fn receive_response(
        &mut self,
        code: u16,
        response: String,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<bool> {
        match (ResponseClass::of(code), self.state) {
            (ResponseClass::Provisional, TransactionState::Proceeding) => {
                if code > 100 && !self.resend_provisional.is_armed() {
                    self.resend_provisional
                        .arm(now, timers::PROVISIONAL_RESPONSE_INTERVAL);
                }
            }
            (ResponseClass::Success, TransactionState::Proceeding) => {
                self.state = TransactionState::Accepted;
                self.resend_provisional.cancel();
                self.timer_l.arm(now, timers::TIMER_L);
            }
            // Retransmitted 2xx from the core.
            (ResponseClass::Success, TransactionState::Accepted) => {}
            (ResponseClass::Failure, TransactionState::Proceeding) => {
                self.state = TransactionState::Completed;
                self.resend_provisional.cancel();
                self.timer_h.arm(now, timers::TIMER_H);
                if self.timers.retransmit {
                    self.timer_g.arm(now, self.g_interval);
                }
            }
            _ => return Ok(false),
        }
        self.last_status = Some(code);
        let sent = transport.send(&response);
        self.last_response = Some(response);
        if !sent {
            self.transport_error();
            return Err(SipError::Transport);
        }
        Ok(true)
    }

    pub fn resend_last_response(&mut self, transport: &mut dyn Transport) {
        if let Some(response) = &self.last_response {
            if !transport.send(response) {
                self.transport_error();
            }
        }
    }

    /// ACK matching a non-2xx final response.
    pub fn receive_ack(&mut self, now: Instant) {
        if self.state != TransactionState::Completed {
            return;
        }
        self.state = TransactionState::Confirmed;
        self.timer_g.cancel();
        self.timer_h.cancel();
        self.timer_i.arm(now, self.timers.i);
    }

    pub fn on_timer(&mut self, transport: &mut dyn Transport, now: Instant) {
        if self.resend_provisional.fire(now) && self.state == TransactionState::Proceeding {
            self.resend_last_response(transport);
            if self.state == TransactionState::Proceeding {
                self.resend_provisional
                    .arm(now, timers::PROVISIONAL_RESPONSE_INTERVAL);
            }
        }

        if self.timer_h.fire(now) && self.state == TransactionState::Completed {
            log::debug!("Timer H expired, no ACK received");
            self.terminate();
            return;
        }

        if self.timer_g.fire(now) && self.state == TransactionState::Completed {
            self.g_interval = (self.g_interval * 2).min(timers::T2);
            self.resend_last_response(transport);
            if self.state == TransactionState::Completed {
                self.timer_g.arm(now, self.g_interval);
            }
        }

        if self.timer_i.fire(now) && self.state == TransactionState::Confirmed {
            self.terminate();
        }
        if self.timer_l.fire(now) && self.state == TransactionState::Accepted {
            self.terminate();
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        timers::earliest([
            self.resend_provisional.deadline(),
            self.timer_g.deadline(),
            self.timer_h.deadline(),
            self.timer_i.deadline(),
            self.timer_l.deadline(),
        ])
    }

    fn transport_error(&mut self) {
        log::debug!("transport error occurred, deleting INVITE server transaction");
        self.terminate();
    }

    fn terminate(&mut self) {
        self.state = TransactionState::Terminated;
        self.resend_provisional.cancel();
        self.timer_g.cancel();
        self.timer_h.cancel();
        self.timer_i.cancel();
        self.timer_l.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::parser::parse_message;
    use crate::transport::MemoryTransport;

    fn invite() -> IncomingRequest {
        let raw = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
                   Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bKist\r\n\
                   To: <sip:bob@biloxi.com>\r\n\
                   From: <sip:alice@atlanta.com>;tag=a\r\n\
                   Call-ID: ist1\r\n\
                   CSeq: 1 INVITE\r\n\r\n";
        match parse_message(raw).unwrap() {
            Message::Request(request) => request,
            Message::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn provisional_is_resent_every_minute() {
        let now = Instant::now();
        let mut transport = MemoryTransport::reliable();
        let mut request = invite();
        let mut tr = InviteServerTransaction::new(&mut request, &mut transport, true, now);
        assert_eq!(tr.state(), TransactionState::Proceeding);

        let ringing = request.build_response(&Reply::new(180), true).unwrap();
        assert_eq!(tr.receive_response(180, ringing.clone(), &mut transport, now), Ok(true));
        tr.on_timer(&mut transport, now + Duration::from_secs(59));
        assert_eq!(transport.sent().len(), 2);
        tr.on_timer(&mut transport, now + Duration::from_secs(60));
        assert_eq!(transport.sent().len(), 3);
        assert_eq!(transport.last_sent(), Some(ringing.as_str()));

        let ok = request.build_response(&Reply::new(200), true).unwrap();
        assert_eq!(tr.receive_response(200, ok.clone(), &mut transport, now), Ok(true));
        assert_eq!(tr.state(), TransactionState::Accepted);
        assert_eq!(tr.receive_response(200, ok, &mut transport, now), Ok(true));
        assert_eq!(tr.receive_response(486, "late".into(), &mut transport, now), Ok(false));

        tr.on_timer(&mut transport, now + timers::TIMER_L);
        assert_eq!(tr.state(), TransactionState::Terminated);
    }

    #[test]
    fn timer_h_ends_completed_without_ack() {
        let now = Instant::now();
        let mut transport = MemoryTransport::new();
        let mut request = invite();
        let mut tr = InviteServerTransaction::new(&mut request, &mut transport, false, now);
        let busy = request.build_response(&Reply::new(486), false).unwrap();
        tr.receive_response(486, busy, &mut transport, now).unwrap();
        assert_eq!(tr.state(), TransactionState::Completed);

        // Timer G retransmits the final response.
        tr.on_timer(&mut transport, now + Duration::from_millis(500));
        assert_eq!(transport.sent().len(), 3);

        tr.on_timer(&mut transport, now + timers::TIMER_H);
        assert_eq!(tr.state(), TransactionState::Terminated);
        assert_eq!(tr.next_deadline(), None);
    }

    #[test]
    fn late_timers_do_not_touch_other_states() {
        let now = Instant::now();
        let mut transport = MemoryTransport::reliable();
        let mut request = invite();
        let mut tr = InviteServerTransaction::new(&mut request, &mut transport, false, now);
        let busy = request.build_response(&Reply::new(603), false).unwrap();
        tr.receive_response(603, busy, &mut transport, now).unwrap();
        tr.receive_ack(now);
        assert_eq!(tr.state(), TransactionState::Confirmed);
        // Timer I is zero on reliable transports; H was cancelled by the ACK.
        tr.on_timer(&mut transport, now);
        assert_eq!(tr.state(), TransactionState::Terminated);
    }
}

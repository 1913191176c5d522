use std::time::{Duration, Instant};

use crate::message::{IncomingResponse, OutgoingRequest, ResponseClass};
use crate::timers::{self, TimerSlot, Timers};
use crate::transport::Transport;

use super::{stamp_via, TransactionEvent, TransactionState};

/// INVITE client transaction: CALLING, PROCEEDING, ACCEPTED, COMPLETED,
/// TERMINATED.
///
/// Non-2xx finals are acknowledged here. ACKs for 2xx belong to the dialog.
#[derive(Debug)]
pub struct InviteClientTransaction {
    id: String,
    request: OutgoingRequest,
    ack: Option<String>,
    state: TransactionState,
    timers: Timers,
    timer_a: TimerSlot,
    a_interval: Duration,
    timer_b: TimerSlot,
    timer_d: TimerSlot,
    timer_m: TimerSlot,
}

impl InviteClientTransaction {
    pub fn new(mut request: OutgoingRequest, branch: String, transport: &dyn Transport, via_host: &str) -> Self {
        stamp_via(&mut request, transport, via_host, &branch);
        Self {
            id: branch,
            request,
            ack: None,
            state: TransactionState::Calling,
            timers: Timers::for_transport(transport.is_reliable()),
            timer_a: TimerSlot::default(),
            a_interval: timers::T1,
            timer_b: TimerSlot::default(),
            timer_d: TimerSlot::default(),
            timer_m: TimerSlot::default(),
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
        self.timer_b.arm(now, timers::TIMER_B);
        if self.timers.retransmit {
            self.timer_a.arm(now, self.a_interval);
        }
        if !transport.send(&self.request.to_string()) {
            return Some(self.transport_error());
        }
        None
    }

    pub fn receive_response(
        &mut self,
        response: IncomingResponse,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Option<TransactionEvent> {
        let pending = matches!(self.state, TransactionState::Calling | TransactionState::Proceeding);
        match response.class() {
            ResponseClass::Provisional => {
                if !pending {
                    return None;
                }
                self.leave_calling();
                self.state = TransactionState::Proceeding;
                Some(TransactionEvent::Response(response))
            }
            ResponseClass::Success => {
                if pending {
                    self.leave_calling();
                    self.state = TransactionState::Accepted;
                    self.timer_m.arm(now, timers::TIMER_M);
                    Some(TransactionEvent::Response(response))
                } else if self.state == TransactionState::Accepted {
                    // Further 2xx (retransmissions or forks) go up for ACKing.
                    Some(TransactionEvent::Response(response))
                } else {
                    None
                }
            }
            ResponseClass::Failure => {
                if pending {
                    self.leave_calling();
                    self.state = TransactionState::Completed;
                    self.ack = Some(self.request.non_2xx_ack(&response).to_string());
                    self.send_ack(transport);
                    self.timer_d.arm(now, self.timers.d);
                    Some(TransactionEvent::Response(response))
                } else {
                    if self.state == TransactionState::Completed {
                        self.send_ack(transport);
                    }
                    None
                }
            }
        }
    }

    pub fn on_timer(&mut self, transport: &mut dyn Transport, now: Instant) -> Option<TransactionEvent> {
        if self.timer_b.fire(now) && self.state == TransactionState::Calling {
            log::debug!("Timer B expired for INVITE client transaction {}", self.id);
            self.terminate();
            return Some(TransactionEvent::RequestTimeout);
        }

        if self.timer_a.fire(now) && self.state == TransactionState::Calling {
            self.a_interval *= 2;
            if !transport.send(&self.request.to_string()) {
                return Some(self.transport_error());
            }
            self.timer_a.arm(now, self.a_interval);
        }

        if self.timer_d.fire(now) && self.state == TransactionState::Completed {
            self.terminate();
        }
        if self.timer_m.fire(now) && self.state == TransactionState::Accepted {
            self.terminate();
        }
        None
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        timers::earliest([
            self.timer_a.deadline(),
            self.timer_b.deadline(),
            self.timer_d.deadline(),
            self.timer_m.deadline(),
        ])
    }

    fn leave_calling(&mut self) {
        self.timer_a.cancel();
        self.timer_b.cancel();
    }

    /// A failed ACK ends the transaction. The final response has already
    /// been reported so no second event is raised.
    fn send_ack(&mut self, transport: &mut dyn Transport) {
        let Some(ack) = &self.ack else {
            return;
        };
        if !transport.send(ack) {
            log::warn!("failed to send ACK for transaction {}", self.id);
            self.terminate();
        }
    }

    fn transport_error(&mut self) -> TransactionEvent {
        log::debug!("transport error occurred, deleting transaction {}", self.id);
        self.terminate();
        TransactionEvent::TransportError
    }

    fn terminate(&mut self) {
        self.state = TransactionState::Terminated;
        self.timer_a.cancel();
        self.timer_b.cancel();
        self.timer_d.cancel();
        self.timer_m.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UaConfig;
    use crate::message::{Message, Method, RequestParams};
    use crate::parser::parse_message;
    use crate::transport::MemoryTransport;

    fn transaction(transport: &MemoryTransport) -> InviteClientTransaction {
        let config = UaConfig::new("sip:alice@example.com".parse().unwrap());
        let request = OutgoingRequest::new(
            Method::Invite,
            "sip:bob@example.com".parse().unwrap(),
            &config,
            RequestParams {
                cseq: Some(10),
                ..RequestParams::default()
            },
            vec!["Contact: <sip:alice@host.invalid>".into()],
            Some("v=0\r\n".into()),
        );
        InviteClientTransaction::new(request, "z9hG4bKict".into(), transport, "host.invalid")
    }

    fn response(code: u16) -> IncomingResponse {
        let raw = format!(
            "SIP/2.0 {} X\r\nVia: SIP/2.0/UDP host.invalid;branch=z9hG4bKict\r\n\
             To: <sip:bob@example.com>;tag=bob\r\nCSeq: 10 INVITE\r\n\r\n",
            code
        );
        match parse_message(&raw).unwrap() {
            Message::Response(response) => response,
            Message::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn non_2xx_final_is_acked_once_per_response() {
        let now = Instant::now();
        let mut transport = MemoryTransport::new();
        let mut tr = transaction(&transport);
        tr.send(&mut transport, now);
        assert!(matches!(
            tr.receive_response(response(180), &mut transport, now),
            Some(TransactionEvent::Response(_))
        ));
        assert_eq!(tr.state(), TransactionState::Proceeding);

        assert!(matches!(
            tr.receive_response(response(486), &mut transport, now),
            Some(TransactionEvent::Response(_))
        ));
        assert_eq!(tr.state(), TransactionState::Completed);
        let ack = transport.last_sent().unwrap().to_string();
        assert!(ack.starts_with("ACK sip:bob@example.com SIP/2.0\r\n"));
        assert!(ack.contains("Via: SIP/2.0/UDP host.invalid;branch=z9hG4bKict\r\n"));
        assert!(ack.contains("To: <sip:bob@example.com>;tag=bob\r\n"));
        assert!(ack.contains("CSeq: 10 ACK\r\n"));
        assert!(ack.ends_with("Content-Length: 0\r\n\r\n"));

        // Retransmitted final: ACK again, nothing reported.
        assert!(tr.receive_response(response(486), &mut transport, now).is_none());
        assert_eq!(transport.sent().len(), 3);

        // Timer D (32s on unreliable transports).
        tr.on_timer(&mut transport, now + Duration::from_secs(31));
        assert_eq!(tr.state(), TransactionState::Completed);
        tr.on_timer(&mut transport, now + Duration::from_secs(32));
        assert_eq!(tr.state(), TransactionState::Terminated);
    }

    #[test]
    fn accepted_passes_further_2xx_and_ends_on_timer_m() {
        let now = Instant::now();
        let mut transport = MemoryTransport::reliable();
        let mut tr = transaction(&transport);
        tr.send(&mut transport, now);
        assert!(tr.receive_response(response(200), &mut transport, now).is_some());
        assert_eq!(tr.state(), TransactionState::Accepted);
        assert!(tr.receive_response(response(200), &mut transport, now).is_some());
        assert!(tr.receive_response(response(180), &mut transport, now).is_none());
        // No ACK from the transaction for a 2xx.
        assert_eq!(transport.sent().len(), 1);

        tr.on_timer(&mut transport, now + timers::TIMER_M);
        assert_eq!(tr.state(), TransactionState::Terminated);
    }

    #[test]
    fn timer_b_only_while_calling() {
        let now = Instant::now();
        let mut transport = MemoryTransport::new();
        let mut tr = transaction(&transport);
        tr.send(&mut transport, now);
        // Timer A retransmits while CALLING.
        tr.on_timer(&mut transport, now + Duration::from_millis(500));
        tr.on_timer(&mut transport, now + Duration::from_millis(1500));
        assert_eq!(transport.sent().len(), 3);
        assert!(matches!(
            tr.on_timer(&mut transport, now + timers::TIMER_B),
            Some(TransactionEvent::RequestTimeout)
        ));

        let mut tr = transaction(&transport);
        tr.send(&mut transport, now);
        tr.receive_response(response(100), &mut transport, now);
        assert!(tr.on_timer(&mut transport, now + timers::TIMER_B).is_none());
        assert_eq!(tr.state(), TransactionState::Proceeding);
    }
}

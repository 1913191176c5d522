use std::time::Instant;

use crate::message::{IncomingResponse, Method, OutgoingRequest};
use crate::request_sender::{RequestSender, SendContext, SenderEvent};
use crate::timers::{self, TimerSlot};
use crate::transaction::{TransactionKey, TransactionState};

use super::{Dialog, SipDialogId};

/// Sends one request inside a dialog.
///
/// Adds the dialog rules on top of [`RequestSender`]: the local CSeq follows
/// authentication retries, 408 and 481 become [`SenderEvent::DialogError`],
/// and a re-INVITE refused with 491 is tried again once after a backoff.
#[derive(Debug)]
pub struct DialogRequestSender {
    dialog: SipDialogId,
    sender: RequestSender,
    reattempt: bool,
    reattempt_timer: TimerSlot,
    /// This sender set the dialog's `uac_pending_reply`.
    holds_uac_pending: bool,
}

impl DialogRequestSender {
    pub fn new(dialog: &Dialog, request: OutgoingRequest) -> Self {
        Self {
            dialog: dialog.id().clone(),
            sender: RequestSender::new(request),
            reattempt: false,
            reattempt_timer: TimerSlot::default(),
            holds_uac_pending: false,
        }
    }

    pub fn dialog_id(&self) -> &SipDialogId {
        &self.dialog
    }

    pub fn sender(&self) -> &RequestSender {
        &self.sender
    }

    pub fn key(&self) -> Option<TransactionKey> {
        self.sender.key()
    }

    pub fn state(&self) -> Option<TransactionState> {
        self.sender.state()
    }

    pub fn is_finished(&self) -> bool {
        !self.reattempt_timer.is_armed() && self.sender.is_finished()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        timers::earliest([self.sender.next_deadline(), self.reattempt_timer.deadline()])
    }

    pub fn send(&mut self, dialog: &mut Dialog, ctx: &mut SendContext<'_>) -> Vec<SenderEvent> {
        let events = self.sender.send(ctx);
        let request = self.sender.request();
        let offer = request.method == Method::Invite || (request.method == Method::Update && request.body.is_some());
        if offer && !self.sender.is_finished() {
            dialog.uac_pending_reply = true;
            self.holds_uac_pending = true;
        }
        self.process(events, Some(dialog), ctx)
    }

    pub fn receive_response(
        &mut self,
        response: IncomingResponse,
        dialog: Option<&mut Dialog>,
        ctx: &mut SendContext<'_>,
    ) -> Vec<SenderEvent> {
        let events = self.sender.receive_response(response, ctx);
        self.process(events, dialog, ctx)
    }

    pub fn on_timer(&mut self, mut dialog: Option<&mut Dialog>, ctx: &mut SendContext<'_>) -> Vec<SenderEvent> {
        let mut events = Vec::new();
        if self.reattempt_timer.fire(ctx.now) {
            match dialog.as_deref_mut() {
                Some(dialog) => {
                    self.reattempt = true;
                    log::debug!("retrying {} after 491", self.sender.request().method);
                    events.extend(self.send(dialog, ctx));
                }
                None => log::debug!("dialog {} gone, dropping 491 retry", self.dialog),
            }
        }
        let fired = self.sender.on_timer(ctx);
        events.extend(self.process(fired, dialog, ctx));
        events
    }

    fn process(
        &mut self,
        events: Vec<SenderEvent>,
        mut dialog: Option<&mut Dialog>,
        ctx: &mut SendContext<'_>,
    ) -> Vec<SenderEvent> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            match event {
                SenderEvent::Authenticated => {
                    if let Some(dialog) = dialog.as_deref_mut() {
                        if let Err(err) = dialog.next_local_seqnum() {
                            log::warn!("dialog {}: {}", dialog.id(), err);
                        }
                    }
                    out.push(SenderEvent::Authenticated);
                }
                SenderEvent::Response(response) if matches!(response.status_code, 408 | 481) => {
                    out.push(SenderEvent::DialogError(response));
                }
                SenderEvent::Response(response)
                    if response.status_code == 491
                        && self.sender.request().method == Method::Invite
                        && !self.reattempt =>
                {
                    match dialog.as_deref_mut().map(Dialog::next_local_seqnum) {
                        Some(Ok(cseq)) => {
                            self.sender.request_mut().set_cseq(cseq);
                            self.reattempt_timer.arm(ctx.now, timers::REQUEST_PENDING_BACKOFF);
                        }
                        _ => out.push(SenderEvent::Response(response)),
                    }
                }
                other => out.push(other),
            }
        }

        if self.holds_uac_pending && self.pending_finished() {
            if let Some(dialog) = dialog {
                dialog.uac_pending_reply = false;
            }
            self.holds_uac_pending = false;
        }
        out
    }

    fn pending_finished(&self) -> bool {
        matches!(
            self.sender.state(),
            None | Some(TransactionState::Accepted | TransactionState::Completed | TransactionState::Terminated)
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::UaConfig;
    use crate::message::Message;
    use crate::parser::parse_message;
    use crate::transport::MemoryTransport;

    fn dialog() -> Dialog {
        let raw = "SIP/2.0 200 OK\r\n\
                   Via: SIP/2.0/TCP host.invalid;branch=z9hG4bKorig\r\n\
                   From: <sip:alice@atlanta.com>;tag=local\r\n\
                   To: <sip:bob@biloxi.com>;tag=remote\r\n\
                   Call-ID: drs1\r\n\
                   CSeq: 1 INVITE\r\n\
                   Contact: <sip:bob@192.0.2.4>\r\n\r\n";
        match parse_message(raw).unwrap() {
            Message::Response(response) => Dialog::new_uac(&response).unwrap(),
            Message::Request(_) => panic!("expected response"),
        }
    }

    fn response(sender: &DialogRequestSender, code: u16) -> IncomingResponse {
        let tr = sender.sender().transaction().unwrap();
        let raw = format!(
            "SIP/2.0 {} X\r\n\
             Via: SIP/2.0/TCP host.invalid;branch={}\r\n\
             From: <sip:alice@atlanta.com>;tag=local\r\n\
             To: <sip:bob@biloxi.com>;tag=remote\r\n\
             Call-ID: drs1\r\n\
             CSeq: {} {}\r\n\r\n",
            code,
            tr.id(),
            tr.request().cseq,
            tr.request().method
        );
        match parse_message(&raw).unwrap() {
            Message::Response(response) => response,
            Message::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn reinvite_glare_retries_once() {
        let now = Instant::now();
        let mut config = UaConfig::new("sip:alice@atlanta.com".parse().unwrap());
        let mut transport = MemoryTransport::reliable();
        let mut dialog = dialog();
        let reinvite = dialog.create_request(Method::Invite, vec![], Some("v=0\r\n".into()), &config).unwrap();
        assert_eq!(reinvite.cseq, 2);
        let mut sender = DialogRequestSender::new(&dialog, reinvite);
        let mut ctx = SendContext {
            transport: &mut transport,
            config: &mut config,
            now,
        };
        assert!(sender.send(&mut dialog, &mut ctx).is_empty());
        assert!(dialog.uac_pending_reply());

        let events = sender.receive_response(response(&sender, 491), Some(&mut dialog), &mut ctx);
        assert!(events.is_empty());
        assert!(!dialog.uac_pending_reply());
        assert!(!sender.is_finished());
        assert_eq!(dialog.local_seqnum(), Some(3));

        ctx.now = now + Duration::from_secs(1);
        assert!(sender.on_timer(Some(&mut dialog), &mut ctx).is_empty());
        assert_eq!(sender.sender().transaction().unwrap().request().cseq, 3);
        assert!(dialog.uac_pending_reply());

        let events = sender.receive_response(response(&sender, 491), Some(&mut dialog), &mut ctx);
        assert!(matches!(events.as_slice(), [SenderEvent::Response(r)] if r.status_code == 491));
    }

    #[test]
    fn timeout_and_gone_map_to_dialog_error() {
        let mut config = UaConfig::new("sip:alice@atlanta.com".parse().unwrap());
        let mut transport = MemoryTransport::reliable();
        let mut dialog = dialog();
        let bye = dialog.create_request(Method::Bye, vec![], None, &config).unwrap();
        let mut sender = DialogRequestSender::new(&dialog, bye);
        let mut ctx = SendContext {
            transport: &mut transport,
            config: &mut config,
            now: Instant::now(),
        };
        sender.send(&mut dialog, &mut ctx);
        assert!(!dialog.uac_pending_reply());
        let events = sender.receive_response(response(&sender, 481), Some(&mut dialog), &mut ctx);
        assert!(matches!(events.as_slice(), [SenderEvent::DialogError(r)] if r.status_code == 481));
    }
}

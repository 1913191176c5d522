use std::time::Instant;

use crate::dialog::SipDialogId;
use crate::message::ResponseClass;
use crate::timers::{TimerSlot, Timers};
use crate::transport::Transport;
use crate::{Result, SipError};

use super::TransactionState;

#[derive(Debug)]
pub struct NonInviteServerTransaction {
    state: TransactionState,
    last_response: Option<String>,
    last_status: Option<u16>,
    timers: Timers,
    timer_j: TimerSlot,
    /// Dialog following this transaction, if the request was in-dialog.
    pub(crate) dialog: Option<SipDialogId>,
}

impl NonInviteServerTransaction {
    pub fn new(transport: &dyn Transport) -> Self {
        Self {
            state: TransactionState::Trying,
            last_response: None,
            last_status: None,
            timers: Timers::for_transport(transport.is_reliable()),
            timer_j: TimerSlot::default(),
            dialog: None,
        }
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

    /// Sends a response produced by the core. `Ok(false)` means nothing was
    /// sent: the state no longer accepts responses, or the response is a
    /// provisional other than 100 (RFC 4320).
    pub fn receive_response(
        &mut self,
        code: u16,
        response: String,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<bool> {
        let provisional = ResponseClass::of(code) == ResponseClass::Provisional;
        if provisional && code != 100 {
            log::debug!("non-INVITE server transaction refuses provisional {}", code);
            return Ok(false);
        }
        match self.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if provisional {
                    self.state = TransactionState::Proceeding;
                } else {
                    self.state = TransactionState::Completed;
                    self.timer_j.arm(now, self.timers.j);
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

    pub fn on_timer(&mut self, now: Instant) {
        if self.timer_j.fire(now) && self.state == TransactionState::Completed {
            self.state = TransactionState::Terminated;
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timer_j.deadline()
    }

    fn transport_error(&mut self) {
        log::debug!("transport error occurred, deleting non-INVITE server transaction");
        self.timer_j.cancel();
        self.state = TransactionState::Terminated;
    }
}

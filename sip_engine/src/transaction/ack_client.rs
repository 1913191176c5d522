use crate::message::OutgoingRequest;
use crate::transport::Transport;

use super::{stamp_via, TransactionEvent, TransactionState};

/// Fire-and-forget ACK for a 2xx. Only a transport failure is reported.
#[derive(Debug)]
pub struct AckClientTransaction {
    id: String,
    request: OutgoingRequest,
    sent: bool,
}

impl AckClientTransaction {
    pub fn new(mut request: OutgoingRequest, branch: String, transport: &dyn Transport, via_host: &str) -> Self {
        stamp_via(&mut request, transport, via_host, &branch);
        Self {
            id: branch,
            request,
            sent: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        if self.sent {
            TransactionState::Terminated
        } else {
            TransactionState::Trying
        }
    }

    pub fn request(&self) -> &OutgoingRequest {
        &self.request
    }

    pub fn send(&mut self, transport: &mut dyn Transport) -> Option<TransactionEvent> {
        self.sent = true;
        if !transport.send(&self.request.to_string()) {
            log::debug!("transport error occurred for ACK {}", self.id);
            return Some(TransactionEvent::TransportError);
        }
        None
    }
}

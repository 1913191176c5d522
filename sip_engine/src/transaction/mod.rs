//! RFC 3261 transaction state machines (with the RFC 6026 ACCEPTED state)
//! and the server transaction registry used for retransmission matching.

use std::collections::HashMap;
use std::time::Instant;

use crate::message::{IncomingRequest, IncomingResponse, Method, OutgoingRequest};
use crate::transport::Transport;

mod ack_client;
mod client_invite;
mod client_non_invite;
mod server_invite;
mod server_non_invite;

pub use ack_client::AckClientTransaction;
pub use client_invite::InviteClientTransaction;
pub use client_non_invite::NonInviteClientTransaction;
pub use server_invite::InviteServerTransaction;
pub use server_non_invite::NonInviteServerTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Calling,
    Accepted,
    Completed,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    NonInviteClient,
    InviteClient,
    AckClient,
    NonInviteServer,
    InviteServer,
}

/// Client transactions are matched by top Via branch and CSeq method, so a
/// CANCEL sharing its INVITE's branch stays distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub method: Method,
}

/// What a client transaction reports to its owner.
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    Response(IncomingResponse),
    RequestTimeout,
    TransportError,
}

/// Stamps the transaction's Via on the request it is about to own.
pub(crate) fn stamp_via(request: &mut OutgoingRequest, transport: &dyn Transport, via_host: &str, branch: &str) {
    let via = format!(
        "SIP/2.0/{} {};branch={}",
        transport.via_transport(),
        via_host,
        branch
    );
    request.headers.set_first("Via", via);
}

#[derive(Debug)]
pub enum ClientTransaction {
    NonInvite(NonInviteClientTransaction),
    Invite(InviteClientTransaction),
    Ack(AckClientTransaction),
}

impl ClientTransaction {
    /// Picks the state machine matching the request method.
    pub fn new(request: OutgoingRequest, branch: String, transport: &dyn Transport, via_host: &str) -> Self {
        match request.method {
            Method::Invite => ClientTransaction::Invite(InviteClientTransaction::new(request, branch, transport, via_host)),
            Method::Ack => ClientTransaction::Ack(AckClientTransaction::new(request, branch, transport, via_host)),
            _ => ClientTransaction::NonInvite(NonInviteClientTransaction::new(request, branch, transport, via_host)),
        }
    }

    pub fn kind(&self) -> TransactionKind {
        match self {
            ClientTransaction::NonInvite(_) => TransactionKind::NonInviteClient,
            ClientTransaction::Invite(_) => TransactionKind::InviteClient,
            ClientTransaction::Ack(_) => TransactionKind::AckClient,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ClientTransaction::NonInvite(tr) => tr.id(),
            ClientTransaction::Invite(tr) => tr.id(),
            ClientTransaction::Ack(tr) => tr.id(),
        }
    }

    pub fn key(&self) -> TransactionKey {
        TransactionKey {
            branch: self.id().to_string(),
            method: self.request().method.clone(),
        }
    }

    pub fn state(&self) -> TransactionState {
        match self {
            ClientTransaction::NonInvite(tr) => tr.state(),
            ClientTransaction::Invite(tr) => tr.state(),
            ClientTransaction::Ack(tr) => tr.state(),
        }
    }

    /// The request as sent, Via included.
    pub fn request(&self) -> &OutgoingRequest {
        match self {
            ClientTransaction::NonInvite(tr) => tr.request(),
            ClientTransaction::Invite(tr) => tr.request(),
            ClientTransaction::Ack(tr) => tr.request(),
        }
    }

    pub fn send(&mut self, transport: &mut dyn Transport, now: Instant) -> Option<TransactionEvent> {
        match self {
            ClientTransaction::NonInvite(tr) => tr.send(transport, now),
            ClientTransaction::Invite(tr) => tr.send(transport, now),
            ClientTransaction::Ack(tr) => tr.send(transport),
        }
    }

    pub fn receive_response(
        &mut self,
        response: IncomingResponse,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Option<TransactionEvent> {
        match self {
            ClientTransaction::NonInvite(tr) => tr.receive_response(response, now),
            ClientTransaction::Invite(tr) => tr.receive_response(response, transport, now),
            ClientTransaction::Ack(_) => None,
        }
    }

    pub fn on_timer(&mut self, transport: &mut dyn Transport, now: Instant) -> Option<TransactionEvent> {
        match self {
            ClientTransaction::NonInvite(tr) => tr.on_timer(transport, now),
            ClientTransaction::Invite(tr) => tr.on_timer(transport, now),
            ClientTransaction::Ack(_) => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self {
            ClientTransaction::NonInvite(tr) => tr.next_deadline(),
            ClientTransaction::Invite(tr) => tr.next_deadline(),
            ClientTransaction::Ack(_) => None,
        }
    }
}

/// Server transactions by branch, one table per kind.
#[derive(Debug, Default)]
pub struct ServerTransactions {
    pub invite: HashMap<String, InviteServerTransaction>,
    pub non_invite: HashMap<String, NonInviteServerTransaction>,
}

/// A server transaction whose state moved, for the dialog that watches it.
#[derive(Debug, Clone)]
pub struct ServerStateChange {
    pub branch: String,
    pub state: TransactionState,
    pub final_status: Option<u16>,
    pub dialog: Option<crate::dialog::SipDialogId>,
}

impl ServerTransactions {
    pub fn state(&self, branch: &str, method: &Method) -> Option<TransactionState> {
        match method {
            Method::Invite | Method::Ack => self.invite.get(branch).map(InviteServerTransaction::state),
            _ => self.non_invite.get(branch).map(NonInviteServerTransaction::state),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let invite = self.invite.values().map(InviteServerTransaction::next_deadline);
        let non_invite = self.non_invite.values().map(NonInviteServerTransaction::next_deadline);
        crate::timers::earliest(invite.chain(non_invite))
    }

    /// Fires due timers and drops terminated transactions. Returns every
    /// state change so dialogs can follow their transactions.
    pub fn poll(&mut self, transport: &mut dyn Transport, now: Instant) -> Vec<ServerStateChange> {
        let mut changes = Vec::new();
        for (branch, tr) in self.invite.iter_mut() {
            let before = tr.state();
            tr.on_timer(transport, now);
            if tr.state() != before {
                changes.push(ServerStateChange {
                    branch: branch.clone(),
                    state: tr.state(),
                    final_status: tr.last_status(),
                    dialog: tr.dialog.clone(),
                });
            }
        }
        for (branch, tr) in self.non_invite.iter_mut() {
            let before = tr.state();
            tr.on_timer(now);
            if tr.state() != before {
                changes.push(ServerStateChange {
                    branch: branch.clone(),
                    state: tr.state(),
                    final_status: tr.last_status(),
                    dialog: tr.dialog.clone(),
                });
            }
        }
        self.invite.retain(|_, tr| tr.state() != TransactionState::Terminated);
        self.non_invite.retain(|_, tr| tr.state() != TransactionState::Terminated);
        changes
    }
}

/// Absorbs retransmissions and CANCELs that belong to an existing server
/// transaction. Returns true when `request` must not reach the core.
pub fn check_transaction(
    registry: &mut ServerTransactions,
    request: &IncomingRequest,
    transport: &mut dyn Transport,
    now: Instant,
) -> bool {
    let Some(branch) = request.via_branch.as_deref() else {
        return false;
    };

    match request.method {
        Method::Invite => {
            let Some(tr) = registry.invite.get_mut(branch) else {
                return false;
            };
            match tr.state() {
                TransactionState::Proceeding | TransactionState::Completed => {
                    tr.resend_last_response(transport);
                }
                _ => {}
            }
            true
        }
        Method::Ack => {
            let Some(tr) = registry.invite.get_mut(branch) else {
                return false;
            };
            match tr.state() {
                // ACK for a 2xx is a separate transaction handled by the dialog.
                TransactionState::Accepted => false,
                TransactionState::Completed => {
                    tr.receive_ack(now);
                    true
                }
                _ => true,
            }
        }
        Method::Cancel => {
            let Some(tr) = registry.invite.get(branch) else {
                reply_stateless(request, 481, None, transport);
                return true;
            };
            reply_stateless(request, 200, None, transport);
            // Only a pending INVITE can still be cancelled by the core.
            tr.state() != TransactionState::Proceeding
        }
        _ => {
            let Some(tr) = registry.non_invite.get_mut(branch) else {
                return false;
            };
            match tr.state() {
                TransactionState::Proceeding | TransactionState::Completed => {
                    tr.resend_last_response(transport);
                }
                _ => {}
            }
            true
        }
    }
}

pub(crate) fn reply_stateless(request: &IncomingRequest, code: u16, reason: Option<&str>, transport: &mut dyn Transport) {
    match request.reply_sl(code, reason) {
        Ok(response) => {
            if !transport.send(&response) {
                log::warn!("failed to send stateless {} for {}", code, request.method);
            }
        }
        Err(err) => log::warn!("cannot build stateless {}: {}", code, err),
    }
}

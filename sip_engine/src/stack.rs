use std::collections::HashMap;
use std::time::Instant;

use crate::config::UaConfig;
use crate::dialog::{Dialog, DialogRequestSender, DialogState, RequestCheck, SipDialogId};
use crate::grammar::{Parsed, Uri};
use crate::message::{IncomingRequest, IncomingResponse, Message, Method, OutgoingRequest, Reply, RequestParams};
use crate::parser::parse_message;
use crate::request_sender::{RequestSender, SendContext, SenderEvent};
use crate::transaction::{
    self, check_transaction, InviteServerTransaction, NonInviteServerTransaction, ServerStateChange,
    ServerTransactions, TransactionKey, TransactionState,
};
use crate::transport::Transport;
use crate::{timers, Result, SipError};

/// Handle for a request sent through [`SipStack::send_request`] or
/// [`SipStack::send_in_dialog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone)]
pub enum CoreEvent {
    Response {
        id: RequestId,
        response: IncomingResponse,
    },
    RequestTimeout(RequestId),
    TransportError(RequestId),
    /// The request was challenged and went out again with credentials.
    Authenticated(RequestId),
    /// 408 or 481 to an in-dialog request.
    DialogError {
        id: RequestId,
        dialog: SipDialogId,
        response: IncomingResponse,
    },
    /// Out-of-dialog request. Answer it with [`SipStack::reply`].
    IncomingRequest(IncomingRequest),
    DialogRequest {
        dialog: SipDialogId,
        request: IncomingRequest,
    },
    DialogTerminated(SipDialogId),
}

#[derive(Debug)]
enum Applicant {
    Plain(RequestSender),
    Dialog(DialogRequestSender),
}

impl Applicant {
    fn key(&self) -> Option<TransactionKey> {
        match self {
            Applicant::Plain(sender) => sender.key(),
            Applicant::Dialog(sender) => sender.key(),
        }
    }

    fn state(&self) -> Option<TransactionState> {
        match self {
            Applicant::Plain(sender) => sender.state(),
            Applicant::Dialog(sender) => sender.state(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Applicant::Plain(sender) => sender.is_finished(),
            Applicant::Dialog(sender) => sender.is_finished(),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match self {
            Applicant::Plain(sender) => sender.next_deadline(),
            Applicant::Dialog(sender) => sender.next_deadline(),
        }
    }

    fn dialog_id(&self) -> Option<&SipDialogId> {
        match self {
            Applicant::Plain(_) => None,
            Applicant::Dialog(sender) => Some(sender.dialog_id()),
        }
    }
}

enum Drive {
    Send,
    Response(IncomingResponse),
    Timer,
}

/// Owns the transport, the transaction and dialog registries and the
/// request senders, and turns inbound frames and timer ticks into
/// [`CoreEvent`]s.
#[derive(Debug)]
pub struct SipStack<T: Transport> {
    config: UaConfig,
    transport: T,
    senders: HashMap<RequestId, Applicant>,
    client_index: HashMap<TransactionKey, RequestId>,
    server: ServerTransactions,
    dialogs: HashMap<SipDialogId, Dialog>,
    /// CANCELs waiting for the INVITE to leave CALLING.
    pending_cancels: HashMap<RequestId, Option<String>>,
    events: Vec<CoreEvent>,
    next_id: u64,
}

impl<T: Transport> SipStack<T> {
    pub fn new(config: UaConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            senders: HashMap::new(),
            client_index: HashMap::new(),
            server: ServerTransactions::default(),
            dialogs: HashMap::new(),
            pending_cancels: HashMap::new(),
            events: Vec::new(),
            next_id: 1,
        }
    }

    pub fn config(&self) -> &UaConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut UaConfig {
        &mut self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Out-of-dialog request with the configured identity filled in.
    pub fn new_request(
        &self,
        method: Method,
        ruri: Uri,
        params: RequestParams,
        extra_headers: Vec<String>,
        body: Option<String>,
    ) -> OutgoingRequest {
        OutgoingRequest::new(method, ruri, &self.config, params, extra_headers, body)
    }

    pub fn send_request(&mut self, request: OutgoingRequest, now: Instant) -> RequestId {
        log::debug!("sending {} to {}", request.method, request.ruri);
        self.start(Applicant::Plain(RequestSender::new(request)), now)
    }

    /// Builds and sends a request inside `dialog`.
    pub fn send_in_dialog(
        &mut self,
        dialog: &SipDialogId,
        method: Method,
        extra_headers: Vec<String>,
        body: Option<String>,
        now: Instant,
    ) -> Result<RequestId> {
        let entry = self
            .dialogs
            .get_mut(dialog)
            .ok_or_else(|| SipError::UnknownDialog(dialog.clone()))?;
        let request = entry.create_request(method, extra_headers, body, &self.config)?;
        let sender = DialogRequestSender::new(entry, request);
        Ok(self.start(Applicant::Dialog(sender), now))
    }

    /// Cancels a pending INVITE sent with [`send_request`](Self::send_request).
    /// While the INVITE is still CALLING the CANCEL waits for the first
    /// provisional response.
    pub fn cancel(&mut self, id: RequestId, reason: Option<&str>, now: Instant) -> Result<()> {
        let Some(Applicant::Plain(sender)) = self.senders.get(&id) else {
            return Err(SipError::InvalidState("no pending request to cancel"));
        };
        if sender.request().method != Method::Invite {
            return Err(SipError::Invalid("only INVITE can be cancelled"));
        }
        match sender.state() {
            Some(TransactionState::Calling) => {
                log::debug!("INVITE still calling, CANCEL deferred");
                self.pending_cancels.insert(id, reason.map(str::to_string));
                Ok(())
            }
            Some(TransactionState::Proceeding) => {
                self.send_cancel(id, reason, now);
                Ok(())
            }
            _ => Err(SipError::InvalidState("INVITE already has a final response")),
        }
    }

    pub fn client_state(&self, id: RequestId) -> Option<TransactionState> {
        self.senders.get(&id).and_then(Applicant::state)
    }

    /// Handles one inbound frame. Unparsable frames are logged, dropped and
    /// returned as the error.
    pub fn receive(&mut self, data: &str, now: Instant) -> Result<()> {
        let message = match parse_message(data) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("dropping unparsable message: {}", err);
                return Err(err);
            }
        };
        match message {
            Message::Request(request) => self.receive_request(request, now),
            Message::Response(response) => self.receive_response(response, now),
        }
        Ok(())
    }

    /// Fires every due timer.
    pub fn poll(&mut self, now: Instant) {
        let mut due: Vec<RequestId> = self
            .senders
            .iter()
            .filter(|(_, applicant)| applicant.next_deadline().is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| *id)
            .collect();
        due.sort();
        for id in due {
            self.drive(id, Drive::Timer, now);
        }

        for change in self.server.poll(&mut self.transport, now) {
            self.server_changed(change);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let senders = self.senders.values().map(Applicant::next_deadline);
        timers::earliest(senders.chain([self.server.next_deadline()]))
    }

    pub fn take_events(&mut self) -> Vec<CoreEvent> {
        std::mem::take(&mut self.events)
    }

    /// Answers `request` through its server transaction. `Ok(false)` means
    /// the transaction is gone or no longer takes this response.
    pub fn reply(&mut self, request: &mut IncomingRequest, reply: Reply, now: Instant) -> Result<bool> {
        let branch = request.via_branch.clone().ok_or(SipError::MissingHeader("Via"))?;
        let response = request.build_response(&reply, self.config.session_timers)?;
        let (outcome, change) = match request.method {
            Method::Ack => return Err(SipError::Invalid("ACK cannot be answered")),
            // Answered statelessly when it arrived.
            Method::Cancel => return Ok(false),
            Method::Invite => {
                let Some(tr) = self.server.invite.get_mut(&branch) else {
                    return Ok(false);
                };
                let before = tr.state();
                let outcome = tr.receive_response(reply.code, response, &mut self.transport, now);
                let change = (tr.state() != before).then(|| ServerStateChange {
                    branch: branch.clone(),
                    state: tr.state(),
                    final_status: tr.last_status(),
                    dialog: tr.dialog.clone(),
                });
                (outcome, change)
            }
            _ => {
                let Some(tr) = self.server.non_invite.get_mut(&branch) else {
                    return Ok(false);
                };
                let before = tr.state();
                let outcome = tr.receive_response(reply.code, response, &mut self.transport, now);
                let change = (tr.state() != before).then(|| ServerStateChange {
                    branch: branch.clone(),
                    state: tr.state(),
                    final_status: tr.last_status(),
                    dialog: tr.dialog.clone(),
                });
                (outcome, change)
            }
        };
        if let Some(change) = change {
            self.server_changed(change);
        }
        outcome
    }

    /// Dialog from a tagged response with a Contact. Returns the existing id
    /// when the dialog is already known.
    pub fn create_uac_dialog(&mut self, response: &IncomingResponse) -> Result<SipDialogId> {
        let dialog = Dialog::new_uac(response)?;
        let id = dialog.id().clone();
        self.dialogs.entry(id.clone()).or_insert(dialog);
        Ok(id)
    }

    /// Dialog for an incoming dialog-creating request. Generates the local
    /// tag now so later replies carry it.
    pub fn create_uas_dialog(&mut self, request: &mut IncomingRequest, state: DialogState) -> Result<SipDialogId> {
        request.ensure_to_tag();
        let dialog = Dialog::new_uas(request, state)?;
        let id = dialog.id().clone();
        self.dialogs.entry(id.clone()).or_insert(dialog);
        Ok(id)
    }

    pub fn confirm_dialog(&mut self, id: &SipDialogId, response: Option<&IncomingResponse>) -> Result<()> {
        let dialog = self
            .dialogs
            .get_mut(id)
            .ok_or_else(|| SipError::UnknownDialog(id.clone()))?;
        dialog.confirm(response);
        Ok(())
    }

    pub fn dialog(&self, id: &SipDialogId) -> Option<&Dialog> {
        self.dialogs.get(id)
    }

    pub fn terminate_dialog(&mut self, id: &SipDialogId) -> bool {
        if self.dialogs.remove(id).is_none() {
            return false;
        }
        log::debug!("dialog {} terminated", id);
        self.events.push(CoreEvent::DialogTerminated(id.clone()));
        true
    }

    fn start(&mut self, applicant: Applicant, now: Instant) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.senders.insert(id, applicant);
        self.drive(id, Drive::Send, now);
        id
    }

    fn drive(&mut self, id: RequestId, action: Drive, now: Instant) {
        let Some(applicant) = self.senders.get_mut(&id) else {
            return;
        };
        let old_key = applicant.key();
        let mut ctx = SendContext {
            transport: &mut self.transport,
            config: &mut self.config,
            now,
        };
        let events = match applicant {
            Applicant::Plain(sender) => match action {
                Drive::Send => sender.send(&mut ctx),
                Drive::Response(response) => sender.receive_response(response, &mut ctx),
                Drive::Timer => sender.on_timer(&mut ctx),
            },
            Applicant::Dialog(sender) => {
                let dialog = self.dialogs.get_mut(sender.dialog_id());
                match action {
                    Drive::Send => match dialog {
                        Some(dialog) => sender.send(dialog, &mut ctx),
                        None => Vec::new(),
                    },
                    Drive::Response(response) => sender.receive_response(response, dialog, &mut ctx),
                    Drive::Timer => sender.on_timer(dialog, &mut ctx),
                }
            }
        };

        let new_key = applicant.key();
        let state = applicant.state();
        let finished = applicant.is_finished() || new_key.is_none();
        let dialog = applicant.dialog_id().cloned();

        if old_key != new_key {
            if let Some(old_key) = old_key {
                self.client_index.remove(&old_key);
            }
        }
        if let Some(key) = new_key {
            if finished {
                self.client_index.remove(&key);
            } else {
                self.client_index.insert(key, id);
            }
        }
        if finished {
            self.senders.remove(&id);
        }

        for event in events {
            let event = match event {
                SenderEvent::Response(response) => CoreEvent::Response { id, response },
                SenderEvent::RequestTimeout => CoreEvent::RequestTimeout(id),
                SenderEvent::TransportError => CoreEvent::TransportError(id),
                SenderEvent::Authenticated => CoreEvent::Authenticated(id),
                SenderEvent::DialogError(response) => match &dialog {
                    Some(dialog) => CoreEvent::DialogError {
                        id,
                        dialog: dialog.clone(),
                        response,
                    },
                    None => CoreEvent::Response { id, response },
                },
            };
            self.events.push(event);
        }

        match state {
            Some(TransactionState::Calling) if !finished => {}
            Some(TransactionState::Proceeding) if !finished => {
                if let Some(reason) = self.pending_cancels.remove(&id) {
                    self.send_cancel(id, reason.as_deref(), now);
                }
            }
            _ => {
                self.pending_cancels.remove(&id);
            }
        }
    }

    fn send_cancel(&mut self, id: RequestId, reason: Option<&str>, now: Instant) {
        let Some(Applicant::Plain(sender)) = self.senders.get(&id) else {
            return;
        };
        let Some(invite) = sender.transaction() else {
            return;
        };
        let cancel = invite.request().cancel_request(reason);
        let branch = invite.id().to_string();
        log::debug!("sending CANCEL for transaction {}", branch);
        self.start(Applicant::Plain(RequestSender::with_branch(cancel, branch)), now);
    }

    fn receive_response(&mut self, response: IncomingResponse, now: Instant) {
        if response.count_header("Via") > 1 {
            log::debug!("more than one Via header field present in the response, dropping");
            return;
        }
        let ours = response
            .via
            .as_ref()
            .is_some_and(|via| via.host.eq_ignore_ascii_case(&self.config.via_host));
        if !ours {
            log::debug!("Via sent-by in the response does not match UA Via host, dropping");
            return;
        }
        let Some(branch) = response.via_branch.clone() else {
            return;
        };
        let key = TransactionKey {
            branch,
            method: response.method.clone(),
        };
        match self.client_index.get(&key) {
            Some(id) => {
                let id = *id;
                self.drive(id, Drive::Response(response), now);
            }
            None => log::debug!(
                "no client transaction for {} {} response, dropping",
                response.status_code,
                response.method
            ),
        }
    }

    fn receive_request(&mut self, mut request: IncomingRequest, now: Instant) {
        if !self.sanity_check(&request) {
            return;
        }
        if check_transaction(&mut self.server, &request, &mut self.transport, now) {
            return;
        }

        let Some(branch) = request.via_branch.clone() else {
            return;
        };
        match request.method {
            Method::Invite => {
                let tr = InviteServerTransaction::new(&mut request, &mut self.transport, self.config.session_timers, now);
                self.server.invite.insert(branch.clone(), tr);
            }
            Method::Ack | Method::Cancel => {}
            _ => {
                let tr = NonInviteServerTransaction::new(&self.transport);
                self.server.non_invite.insert(branch.clone(), tr);
            }
        }

        let (Some(local_tag), Some(remote_tag)) = (request.to_tag.clone(), request.from_tag.clone()) else {
            match request.method {
                Method::Bye => {
                    self.answer(&mut request, Reply::new(481), now);
                }
                Method::Ack => log::debug!("ACK outside of a dialog, ignoring"),
                _ => self.events.push(CoreEvent::IncomingRequest(request)),
            }
            return;
        };

        let id = SipDialogId {
            call_id: request.call_id.clone(),
            local_tag,
            remote_tag,
        };
        let Some(dialog) = self.dialogs.get_mut(&id) else {
            if request.method != Method::Ack {
                self.answer(&mut request, Reply::new(481), now);
            }
            return;
        };
        match dialog.check_in_dialog_request(&request) {
            RequestCheck::Accepted => {
                dialog.receive_request(&request);
                if let Some(tr) = self.server.invite.get_mut(&branch) {
                    tr.dialog = Some(id.clone());
                } else if let Some(tr) = self.server.non_invite.get_mut(&branch) {
                    tr.dialog = Some(id.clone());
                }
                self.events.push(CoreEvent::DialogRequest { dialog: id, request });
            }
            RequestCheck::Rejected(Some(reply)) => {
                self.answer(&mut request, reply, now);
            }
            RequestCheck::Rejected(None) => {}
        }
    }

    /// `reply` for responses the stack generates itself.
    fn answer(&mut self, request: &mut IncomingRequest, reply: Reply, now: Instant) {
        let code = reply.code;
        if let Err(err) = self.reply(request, reply, now) {
            log::warn!("failed to send {} for {}: {}", code, request.method, err);
        }
    }

    /// Drops requests that cannot be answered and rejects malformed ones.
    fn sanity_check(&mut self, request: &IncomingRequest) -> bool {
        if request.via_branch.is_none() {
            log::debug!("request without Via branch, dropping");
            return false;
        }
        let reject = |stack: &mut Self, code: u16, reason: &str| {
            log::debug!("sanity check failed for {}: {}", request.method, reason);
            if request.method != Method::Ack {
                transaction::reply_stateless(request, code, Some(reason), &mut stack.transport);
            }
            false
        };

        for (name, present) in [
            ("Call-ID", !request.call_id.is_empty()),
            ("CSeq", request.has_header("CSeq")),
            ("From", request.from.is_some()),
            ("To", request.to.is_some()),
        ] {
            if !present {
                return reject(self, 400, &format!("Missing {} Header", name));
            }
        }

        if !matches!(request.ruri.scheme.as_str(), "sip" | "sips") {
            return reject(self, 416, "Unsupported URI Scheme");
        }
        let cseq_method = match request.peek_header("CSeq", 0) {
            Some(Parsed::CSeq(cseq)) => Some(cseq.method),
            _ => None,
        };
        if cseq_method.as_ref() != Some(&request.method) {
            return reject(self, 400, "CSeq Method Mismatch");
        }
        if let Some(Parsed::Number(length)) = request.peek_header("Content-Length", 0) {
            if request.body.len() < length as usize {
                return reject(self, 400, "Message body length is lower than the value in Content-Length header field");
            }
        }
        // Our own out-of-dialog request came back.
        if request.to_tag.is_none() && request.call_id.starts_with(&self.config.call_id_prefix) {
            return reject(self, 482, "Loop Detected");
        }
        true
    }

    fn server_changed(&mut self, change: ServerStateChange) {
        let Some(id) = &change.dialog else {
            return;
        };
        if let Some(dialog) = self.dialogs.get_mut(id) {
            dialog.server_transaction_changed(&change.branch, change.state, change.final_status);
        }
    }
}

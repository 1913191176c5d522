use std::time::Instant;

use crate::auth::{DigestAuthentication, DigestRequest};
use crate::config::UaConfig;
use crate::grammar::Parsed;
use crate::message::{IncomingResponse, OutgoingRequest};
use crate::transaction::{ClientTransaction, TransactionEvent, TransactionKey, TransactionState};
use crate::transport::Transport;
use crate::utils;

/// Borrowed pieces of the stack a sender needs while it runs.
pub struct SendContext<'a> {
    pub transport: &'a mut dyn Transport,
    pub config: &'a mut UaConfig,
    pub now: Instant,
}

#[derive(Debug, Clone)]
pub enum SenderEvent {
    Response(IncomingResponse),
    RequestTimeout,
    TransportError,
    /// A challenge was answered and the request went out again.
    Authenticated,
    /// 408 or 481 for an in-dialog request.
    DialogError(IncomingResponse),
}

/// Sends one request through a client transaction and answers at most one
/// Digest challenge (plus one more if the server flags the nonce stale).
#[derive(Debug)]
pub struct RequestSender {
    request: OutgoingRequest,
    transaction: Option<ClientTransaction>,
    /// Branch forced on every transaction, used for CANCEL.
    branch: Option<String>,
    auth: Option<DigestAuthentication>,
    challenged: bool,
    staled: bool,
}

impl RequestSender {
    pub fn new(request: OutgoingRequest) -> Self {
        Self {
            request,
            transaction: None,
            branch: None,
            auth: None,
            challenged: false,
            staled: false,
        }
    }

    pub fn with_branch(request: OutgoingRequest, branch: String) -> Self {
        Self {
            branch: Some(branch),
            ..Self::new(request)
        }
    }

    pub fn request(&self) -> &OutgoingRequest {
        &self.request
    }

    pub(crate) fn request_mut(&mut self) -> &mut OutgoingRequest {
        &mut self.request
    }

    pub fn transaction(&self) -> Option<&ClientTransaction> {
        self.transaction.as_ref()
    }

    pub fn state(&self) -> Option<TransactionState> {
        self.transaction.as_ref().map(ClientTransaction::state)
    }

    pub fn key(&self) -> Option<TransactionKey> {
        self.transaction.as_ref().map(ClientTransaction::key)
    }

    pub fn is_finished(&self) -> bool {
        self.state() == Some(TransactionState::Terminated)
    }

    /// Starts a new client transaction for the current request.
    pub fn send(&mut self, ctx: &mut SendContext<'_>) -> Vec<SenderEvent> {
        let branch = self.branch.clone().unwrap_or_else(utils::new_branch);
        let mut transaction = ClientTransaction::new(self.request.clone(), branch, &*ctx.transport, &ctx.config.via_host);
        let event = transaction.send(ctx.transport, ctx.now);
        self.transaction = Some(transaction);
        event.map(|event| self.handle_event(event, ctx)).unwrap_or_default()
    }

    pub fn receive_response(&mut self, response: IncomingResponse, ctx: &mut SendContext<'_>) -> Vec<SenderEvent> {
        let Some(transaction) = self.transaction.as_mut() else {
            return Vec::new();
        };
        match transaction.receive_response(response, ctx.transport, ctx.now) {
            Some(event) => self.handle_event(event, ctx),
            None => Vec::new(),
        }
    }

    pub fn on_timer(&mut self, ctx: &mut SendContext<'_>) -> Vec<SenderEvent> {
        let Some(transaction) = self.transaction.as_mut() else {
            return Vec::new();
        };
        match transaction.on_timer(ctx.transport, ctx.now) {
            Some(event) => self.handle_event(event, ctx),
            None => Vec::new(),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.transaction.as_ref().and_then(ClientTransaction::next_deadline)
    }

    fn handle_event(&mut self, event: TransactionEvent, ctx: &mut SendContext<'_>) -> Vec<SenderEvent> {
        match event {
            TransactionEvent::Response(response) => self.handle_response(response, ctx),
            TransactionEvent::RequestTimeout => vec![SenderEvent::RequestTimeout],
            TransactionEvent::TransportError => vec![SenderEvent::TransportError],
        }
    }

    fn handle_response(&mut self, mut response: IncomingResponse, ctx: &mut SendContext<'_>) -> Vec<SenderEvent> {
        let status = response.status_code;
        if !(status == 401 || status == 407) || !ctx.config.credentials.can_authenticate() {
            return vec![SenderEvent::Response(response)];
        }
        let (challenge_header, authorization_header) = if status == 401 {
            ("WWW-Authenticate", "Authorization")
        } else {
            ("Proxy-Authenticate", "Proxy-Authorization")
        };

        let Some(challenge) = response
            .parse_header(challenge_header, 0)
            .and_then(Parsed::as_challenge)
            .cloned()
        else {
            log::warn!("{} {} received but no {} header present", status, response.reason_phrase, challenge_header);
            return vec![SenderEvent::Response(response)];
        };

        if self.challenged && (self.staled || !challenge.stale) {
            return vec![SenderEvent::Response(response)];
        }

        let auth = self
            .auth
            .get_or_insert_with(|| DigestAuthentication::new(ctx.config.credentials.clone()));
        let ruri = self.request.ruri.to_string();
        let digest_request = DigestRequest {
            method: self.request.method.as_str(),
            ruri: &ruri,
            body: self.request.body.as_deref(),
        };
        if !auth.authenticate(digest_request, &challenge) {
            return vec![SenderEvent::Response(response)];
        }
        let header = match auth.header_value() {
            Ok(header) => header,
            Err(err) => {
                log::warn!("{}", err);
                return vec![SenderEvent::Response(response)];
            }
        };
        ctx.config.credentials.realm = auth.realm().map(str::to_string);
        ctx.config.credentials.ha1 = auth.ha1().map(str::to_string);

        self.challenged = true;
        if challenge.stale {
            self.staled = true;
        }
        let cseq = self.request.cseq + 1;
        self.request.set_cseq(cseq);
        self.request.set_header(authorization_header, header);
        log::debug!("answering {} challenge for {}", status, self.request.method);

        let mut events = vec![SenderEvent::Authenticated];
        events.extend(self.send(ctx));
        events
    }
}

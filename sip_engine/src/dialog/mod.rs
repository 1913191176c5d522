//! Dialog state (RFC 3261 section 12): identity, sequence numbers, route
//! set and remote target, plus the in-dialog request checks.

use std::fmt;

use crate::config::UaConfig;
use crate::constants::MAX_CSEQ;
use crate::grammar::Uri;
use crate::message::{IncomingRequest, IncomingResponse, Method, OutgoingRequest, Reply, RequestParams, ResponseClass};
use crate::transaction::TransactionState;
use crate::{utils, Result, SipError};

mod request_sender;

pub use request_sender::DialogRequestSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Uac, // we sent the dialog-creating request
    Uas, // remote sent it
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipDialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl fmt::Display for SipDialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Outcome of [`Dialog::check_in_dialog_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestCheck {
    Accepted,
    /// Send this reply (if any) and stop processing the request.
    Rejected(Option<Reply>),
}

/// Follow-up work tied to a server transaction carrying an in-dialog request.
#[derive(Debug, Clone)]
struct ServerWatch {
    branch: String,
    clears_uas_pending: bool,
    retarget: Option<Uri>,
    retarget_on: TransactionState,
}

#[derive(Debug, Clone)]
pub struct Dialog {
    id: SipDialogId,
    role: DialogRole,
    state: DialogState,
    local_uri: Uri,
    remote_uri: Uri,
    remote_target: Uri,
    route_set: Vec<String>,
    local_seqnum: Option<u32>,
    remote_seqnum: Option<u32>,
    ack_seqnum: Option<u32>,
    pub(crate) uac_pending_reply: bool,
    pub(crate) uas_pending_reply: bool,
    watches: Vec<ServerWatch>,
}

impl Dialog {
    /// Dialog created by an incoming request we answered (or are about to
    /// answer) with a tagged response.
    pub fn new_uas(request: &IncomingRequest, state: DialogState) -> Result<Self> {
        let remote_target = request.contact_uri().ok_or(SipError::MissingHeader("Contact"))?;
        let local_tag = request
            .to_tag
            .clone()
            .ok_or(SipError::InvalidState("request has no local tag yet"))?;
        let remote_tag = request.from_tag.clone().ok_or(SipError::MissingHeader("From"))?;
        let local_uri = request.to.as_ref().ok_or(SipError::MissingHeader("To"))?.uri.clone();
        let remote_uri = request.from.as_ref().ok_or(SipError::MissingHeader("From"))?.uri.clone();

        let id = SipDialogId {
            call_id: request.call_id.clone(),
            local_tag,
            remote_tag,
        };
        log::debug!("new UAS dialog created with status {:?}: {}", state, id);
        Ok(Self {
            id,
            role: DialogRole::Uas,
            state,
            local_uri,
            remote_uri,
            remote_target,
            route_set: request.header_values("Record-Route").into_iter().map(str::to_string).collect(),
            local_seqnum: None,
            remote_seqnum: Some(request.cseq),
            ack_seqnum: Some(request.cseq),
            uac_pending_reply: false,
            uas_pending_reply: false,
            watches: Vec::new(),
        })
    }

    /// Dialog created by a tagged provisional or 2xx response to our request.
    pub fn new_uac(response: &IncomingResponse) -> Result<Self> {
        let remote_target = response.contact_uri().ok_or(SipError::MissingHeader("Contact"))?;
        let local_tag = response.from_tag.clone().ok_or(SipError::MissingHeader("From"))?;
        let remote_tag = response
            .to_tag
            .clone()
            .ok_or(SipError::InvalidState("response has no To tag"))?;
        let local_uri = response.from.as_ref().ok_or(SipError::MissingHeader("From"))?.uri.clone();
        let remote_uri = response.to.as_ref().ok_or(SipError::MissingHeader("To"))?.uri.clone();
        let state = if response.class() == ResponseClass::Provisional {
            DialogState::Early
        } else {
            DialogState::Confirmed
        };

        let id = SipDialogId {
            call_id: response.call_id.clone(),
            local_tag,
            remote_tag,
        };
        log::debug!("new UAC dialog created with status {:?}: {}", state, id);
        Ok(Self {
            id,
            role: DialogRole::Uac,
            state,
            local_uri,
            remote_uri,
            remote_target,
            route_set: reversed_record_route(response),
            local_seqnum: Some(response.cseq),
            remote_seqnum: None,
            ack_seqnum: None,
            uac_pending_reply: false,
            uas_pending_reply: false,
            watches: Vec::new(),
        })
    }

    pub fn id(&self) -> &SipDialogId {
        &self.id
    }

    pub fn role(&self) -> DialogRole {
        self.role
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn local_uri(&self) -> &Uri {
        &self.local_uri
    }

    pub fn remote_uri(&self) -> &Uri {
        &self.remote_uri
    }

    pub fn remote_target(&self) -> &Uri {
        &self.remote_target
    }

    pub fn route_set(&self) -> &[String] {
        &self.route_set
    }

    pub fn local_seqnum(&self) -> Option<u32> {
        self.local_seqnum
    }

    pub fn remote_seqnum(&self) -> Option<u32> {
        self.remote_seqnum
    }

    pub fn uac_pending_reply(&self) -> bool {
        self.uac_pending_reply
    }

    pub fn uas_pending_reply(&self) -> bool {
        self.uas_pending_reply
    }

    /// Early to confirmed. A UAC takes route set and target from the 2xx.
    pub fn confirm(&mut self, response: Option<&IncomingResponse>) {
        self.state = DialogState::Confirmed;
        if let (DialogRole::Uac, Some(response)) = (self.role, response) {
            self.route_set = reversed_record_route(response);
            if let Some(target) = response.contact_uri() {
                self.remote_target = target;
            }
        }
        log::debug!("dialog {} confirmed", self.id);
    }

    /// Next CSeq for a new in-dialog request. Picks a random start the first
    /// time a UAS dialog sends.
    /// Fails once the sequence would reach 2^31.
    pub(crate) fn next_local_seqnum(&mut self) -> Result<u32> {
        let next = match self.local_seqnum {
            Some(seq) => seq
                .checked_add(1)
                .filter(|next| *next <= MAX_CSEQ)
                .ok_or(SipError::InvalidState("CSeq space exhausted"))?,
            None => utils::initial_cseq(),
        };
        self.local_seqnum = Some(next);
        Ok(next)
    }

    /// Builds an in-dialog request addressed to the remote target. ACK and
    /// CANCEL reuse the current local sequence number.
    pub fn create_request(
        &mut self,
        method: Method,
        extra_headers: Vec<String>,
        body: Option<String>,
        config: &UaConfig,
    ) -> Result<OutgoingRequest> {
        let cseq = match method {
            Method::Ack | Method::Cancel => match self.local_seqnum {
                Some(seq) => seq,
                None => self.next_local_seqnum()?,
            },
            _ => self.next_local_seqnum()?,
        };
        Ok(OutgoingRequest::new(
            method,
            self.remote_target.clone(),
            config,
            RequestParams {
                route_set: Some(self.route_set.clone()),
                to_uri: Some(self.remote_uri.clone()),
                to_tag: Some(self.id.remote_tag.clone()),
                from_uri: Some(self.local_uri.clone()),
                from_tag: Some(self.id.local_tag.clone()),
                call_id: Some(self.id.call_id.clone()),
                cseq: Some(cseq),
                ..RequestParams::default()
            },
            extra_headers,
            body,
        ))
    }

    /// Sequence and glare checks for a request inside this dialog.
    pub fn check_in_dialog_request(&mut self, request: &IncomingRequest) -> RequestCheck {
        match self.remote_seqnum {
            None => self.remote_seqnum = Some(request.cseq),
            Some(remote) if request.cseq < remote => {
                if request.method != Method::Ack {
                    return RequestCheck::Rejected(Some(Reply::new(500)));
                }
                if self.ack_seqnum != Some(request.cseq) {
                    return RequestCheck::Rejected(None);
                }
            }
            Some(remote) if request.cseq > remote => self.remote_seqnum = Some(request.cseq),
            Some(_) => {}
        }

        let offer = request.method == Method::Invite || (request.method == Method::Update && !request.body.is_empty());
        let mut clears_uas_pending = false;
        if offer {
            if self.uac_pending_reply {
                return RequestCheck::Rejected(Some(Reply::new(491)));
            }
            if self.uas_pending_reply {
                let retry_after = utils::retry_after_jitter();
                return RequestCheck::Rejected(Some(
                    Reply::new(500).header(format!("Retry-After: {}", retry_after)),
                ));
            }
            self.uas_pending_reply = true;
            clears_uas_pending = true;
        }

        let retarget_on = match request.method {
            Method::Invite => Some(TransactionState::Accepted),
            Method::Update | Method::Notify => Some(TransactionState::Completed),
            _ => None,
        };
        let retarget = retarget_on.and_then(|_| request.contact_uri());

        if let (Some(branch), true) = (&request.via_branch, clears_uas_pending || retarget.is_some()) {
            self.watches.push(ServerWatch {
                branch: branch.clone(),
                clears_uas_pending,
                retarget,
                retarget_on: retarget_on.unwrap_or(TransactionState::Completed),
            });
        }
        RequestCheck::Accepted
    }

    /// Records an accepted in-dialog request.
    pub fn receive_request(&mut self, request: &IncomingRequest) {
        if request.method == Method::Ack && self.ack_seqnum.is_some() {
            self.ack_seqnum = None;
        } else if request.method == Method::Invite {
            self.ack_seqnum = Some(request.cseq);
        }
    }

    /// Follows the server transaction of an in-dialog request.
    pub(crate) fn server_transaction_changed(&mut self, branch: &str, state: TransactionState, final_status: Option<u16>) {
        let success = final_status.is_some_and(|code| ResponseClass::of(code) == ResponseClass::Success);
        let finished = matches!(
            state,
            TransactionState::Accepted | TransactionState::Completed | TransactionState::Terminated
        );
        let mut remaining = Vec::with_capacity(self.watches.len());
        for watch in std::mem::take(&mut self.watches) {
            if watch.branch != branch {
                remaining.push(watch);
                continue;
            }
            if state == watch.retarget_on && success {
                if let Some(target) = &watch.retarget {
                    log::debug!("dialog {} remote target updated to {}", self.id, target);
                    self.remote_target = target.clone();
                }
            }
            if !finished {
                remaining.push(watch);
                continue;
            }
            if watch.clears_uas_pending {
                self.uas_pending_reply = false;
            }
        }
        self.watches = remaining;
    }
}

fn reversed_record_route(response: &IncomingResponse) -> Vec<String> {
    response
        .header_values("Record-Route")
        .into_iter()
        .rev()
        .map(str::to_string)
        .collect()
}

//! SIP signaling engine: message model and parser, RFC 3261 transaction state
//! machines, dialogs and Digest authentication with automatic retry.
//!
//! The engine performs no I/O of its own. A [`Transport`] writes frames, the
//! driver hands inbound frames to [`SipStack::receive`] and calls
//! [`SipStack::poll`] so timers can fire. Outcomes come back as [`CoreEvent`]s.

use thiserror::Error;

pub mod auth;
pub mod config;
pub mod constants;
pub mod dialog;
pub mod grammar;
pub mod message;
pub mod parser;
pub mod registration;
pub mod request_sender;
pub mod stack;
pub mod timers;
pub mod transaction;
pub mod transport;
pub mod utils;

pub use auth::{Credentials, DigestAuthentication, DigestRequest};
pub use config::UaConfig;
pub use dialog::{Dialog, DialogRole, DialogState, RequestCheck, SipDialogId};
pub use grammar::{Challenge, NameAddr, Params, Parsed, Rule, Uri, Via};
pub use message::{
    headerize, Headers, IncomingMessage, IncomingRequest, IncomingResponse, Message, Method,
    OutgoingRequest, Reply, RequestParams, ResponseClass,
};
pub use parser::parse_message;
pub use registration::{RegistrationResult, RegistrationState, Registrator};
pub use request_sender::{RequestSender, SendContext, SenderEvent};
pub use stack::{CoreEvent, RequestId, SipStack};
pub use transaction::{TransactionEvent, TransactionKind, TransactionState};
pub use transport::{MemoryTransport, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SipError {
    #[error("invalid message: {0}")]
    Invalid(&'static str),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid status code: {0}")]
    InvalidStatusCode(u16),
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("unknown dialog: {0}")]
    UnknownDialog(SipDialogId),
    #[error("authentication error: {0}")]
    Auth(&'static str),
    #[error("transport error")]
    Transport,
}

pub type Result<T> = std::result::Result<T, SipError>;

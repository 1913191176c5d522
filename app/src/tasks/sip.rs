use std::sync::mpsc::TryRecvError;
use std::thread;
use std::time::{Duration, Instant};

use sip_engine::{
    CoreEvent, DialogState, IncomingRequest, IncomingResponse, Method, RegistrationResult, RegistrationState,
    Registrator, Reply, RequestId, RequestParams, ResponseClass, SipDialogId, SipStack, Uri,
};

use crate::messages::{SipCommand, SipCommandReceiver};
use crate::settings::Settings;
use crate::tasks::task::{AppTask, TaskMeta};
use crate::transport::UdpTransport;

const REGISTER_RETRY: Duration = Duration::from_secs(30);
const IDLE_SLEEP: Duration = Duration::from_millis(10);
/// How long `quit` waits for the un-REGISTER to be answered.
const QUIT_GRACE: Duration = Duration::from_secs(2);

/// The one call this agent handles at a time.
#[derive(Debug)]
enum Call {
    /// INVITE sent, no final response yet.
    Outgoing {
        invite: RequestId,
        dialog: Option<SipDialogId>,
    },
    Established(SipDialogId),
}

pub struct SipTask {
    settings: &'static Settings,
    sip_rx: SipCommandReceiver,

    stack: SipStack<UdpTransport>,
    registrator: Registrator,
    rx_buf: [u8; 4096],

    call: Option<Call>,
    next_register: Option<Instant>,
    quit_at: Option<Instant>,
    last_reg_state: RegistrationState,
}

impl SipTask {
    pub fn new(settings: &'static Settings, sip_rx: SipCommandReceiver, stack: SipStack<UdpTransport>) -> Self {
        let registrator = Registrator::new(&stack);
        Self {
            settings,
            sip_rx,
            stack,
            registrator,
            rx_buf: [0u8; 4096],
            call: None,
            next_register: Some(Instant::now()),
            quit_at: None,
            last_reg_state: RegistrationState::Unregistered,
        }
    }

    fn run(mut self) {
        log::info!(
            "SIP task started: local {:?}, next hop {}",
            self.stack.transport().local_addr(),
            self.stack.transport().peer()
        );

        loop {
            let now = Instant::now();

            if !self.poll_commands(now) {
                break;
            }
            self.maybe_send_register(now);
            self.poll_sip_socket(now);
            self.stack.poll(now);
            self.dispatch_events(now);

            if let Some(quit_at) = self.quit_at {
                if self.registrator.pending().is_none() || now >= quit_at {
                    break;
                }
            }

            let idle = self
                .stack
                .next_deadline()
                .map(|at| at.saturating_duration_since(now).min(IDLE_SLEEP))
                .unwrap_or(IDLE_SLEEP);
            thread::sleep(idle);
        }
        log::info!("SIP task stopped");
    }

    // --- Registration ----------------------------------------------------------

    fn maybe_send_register(&mut self, now: Instant) {
        if self.quit_at.is_some() || self.registrator.pending().is_some() {
            return;
        }
        let scheduled = self.next_register.is_some_and(|at| at <= now);
        if scheduled || self.registrator.refresh_due(now) {
            self.next_register = None;
            log::info!("sending REGISTER");
            self.registrator.register(&mut self.stack, now);
        }
    }

    fn handle_registration_result(&mut self, result: RegistrationResult, now: Instant) {
        match result {
            RegistrationResult::Registered(expires) => {
                log::info!(
                    "registration succeeded ({}s); refresh in {}s",
                    expires,
                    self.registrator.next_refresh_interval_secs()
                );
            }
            RegistrationResult::Unregistered => log::info!("unregistered"),
            RegistrationResult::Failed(code) => {
                log::warn!("registration failed with status {}", code);
                self.next_register = Some(now + REGISTER_RETRY);
            }
            RegistrationResult::RequestTimeout | RegistrationResult::TransportError => {
                log::warn!("registration failed: {:?}", result);
                self.next_register = Some(now + REGISTER_RETRY);
            }
        }

        let state = self.registrator.state();
        if state != self.last_reg_state {
            self.last_reg_state = state;
            log::info!("registration state -> {:?}", state);
        }
    }

    // --- Network receive -------------------------------------------------------

    fn poll_sip_socket(&mut self, now: Instant) {
        loop {
            let len = match self.stack.transport().recv(&mut self.rx_buf) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("SIP recv error: {:?}", e);
                    break;
                }
            };
            let Ok(text) = core::str::from_utf8(&self.rx_buf[..len]) else {
                log::debug!("dropping non UTF-8 datagram ({} bytes)", len);
                continue;
            };
            if let Err(e) = self.stack.receive(text, now) {
                log::debug!("dropping datagram: {}", e);
            }
        }
    }

    fn dispatch_events(&mut self, now: Instant) {
        for event in self.stack.take_events() {
            if let Some(result) = self.registrator.handle_event(&mut self.stack, &event, now) {
                self.handle_registration_result(result, now);
                continue;
            }
            self.handle_core_event(event, now);
        }
    }

    fn handle_core_event(&mut self, event: CoreEvent, now: Instant) {
        match event {
            CoreEvent::Response { id, response } => self.on_invite_response(id, response, now),
            CoreEvent::RequestTimeout(id) | CoreEvent::TransportError(id) => {
                if self.is_pending_invite(id) {
                    log::warn!("call attempt failed: {:?}", event);
                    self.end_call();
                }
            }
            CoreEvent::Authenticated(id) => log::debug!("request {:?} resent with credentials", id),
            CoreEvent::DialogError { dialog, response, .. } => {
                log::warn!("dialog {} failed with {}", dialog, response.status_code);
                self.stack.terminate_dialog(&dialog);
                self.forget_dialog(&dialog);
            }
            CoreEvent::IncomingRequest(request) => self.on_incoming_request(request, now),
            CoreEvent::DialogRequest { dialog, request } => self.on_dialog_request(dialog, request, now),
            CoreEvent::DialogTerminated(dialog) => log::info!("dialog {} terminated", dialog),
        }
    }

    fn is_pending_invite(&self, id: RequestId) -> bool {
        matches!(self.call, Some(Call::Outgoing { invite, .. }) if invite == id)
    }

    // --- Outgoing calls --------------------------------------------------------

    fn start_call(&mut self, target: &str, now: Instant) {
        if self.call.is_some() {
            log::warn!("already in a call");
            return;
        }
        let ruri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                log::warn!("bad target {}: {}", target, e);
                return;
            }
        };
        let contact = format!("Contact: <{}>", self.stack.config().contact);
        let invite = self
            .stack
            .new_request(Method::Invite, ruri, RequestParams::default(), vec![contact], None);
        log::info!("calling {}", target);
        let invite = self.stack.send_request(invite, now);
        self.call = Some(Call::Outgoing { invite, dialog: None });
    }

    fn on_invite_response(&mut self, id: RequestId, response: IncomingResponse, now: Instant) {
        if !self.is_pending_invite(id) {
            log::debug!("response {} for request {:?}", response.status_code, id);
            return;
        }
        match response.class() {
            ResponseClass::Provisional => {
                log::info!("call progress: {}", response.status_code);
                if response.to_tag.is_some() && response.has_header("Contact") {
                    match self.stack.create_uac_dialog(&response) {
                        Ok(dialog) => {
                            if let Some(Call::Outgoing { dialog: early, .. }) = &mut self.call {
                                *early = Some(dialog);
                            }
                        }
                        Err(e) => log::debug!("no early dialog: {}", e),
                    }
                }
            }
            ResponseClass::Success => {
                let dialog = match self.stack.create_uac_dialog(&response) {
                    Ok(dialog) => dialog,
                    Err(e) => {
                        log::warn!("cannot build dialog from 2xx: {}", e);
                        self.end_call();
                        return;
                    }
                };
                if let Err(e) = self.stack.confirm_dialog(&dialog, Some(&response)) {
                    log::warn!("cannot confirm dialog {}: {}", dialog, e);
                }
                if let Err(e) = self.stack.send_in_dialog(&dialog, Method::Ack, vec![], None, now) {
                    log::warn!("cannot send ACK: {}", e);
                }
                log::info!("call established ({})", dialog);
                self.call = Some(Call::Established(dialog));
            }
            ResponseClass::Failure => {
                log::info!("call rejected: {} {}", response.status_code, response.reason_phrase);
                self.end_call();
            }
        }
    }

    fn hangup(&mut self, now: Instant) {
        match self.call.take() {
            Some(Call::Established(dialog)) => {
                log::info!("hanging up {}", dialog);
                if let Err(e) = self.stack.send_in_dialog(&dialog, Method::Bye, vec![], None, now) {
                    log::warn!("cannot send BYE: {}", e);
                }
                self.stack.terminate_dialog(&dialog);
            }
            Some(Call::Outgoing { invite, dialog }) => {
                log::info!("cancelling call attempt");
                if let Err(e) = self.stack.cancel(invite, None, now) {
                    log::warn!("cannot cancel: {}", e);
                }
                // Final response still arrives; keep tracking it.
                self.call = Some(Call::Outgoing { invite, dialog });
            }
            None => log::info!("no call to hang up"),
        }
    }

    fn end_call(&mut self) {
        if let Some(Call::Outgoing { dialog: Some(dialog), .. } | Call::Established(dialog)) = self.call.take() {
            self.stack.terminate_dialog(&dialog);
        }
    }

    fn forget_dialog(&mut self, id: &SipDialogId) {
        let ours = match &self.call {
            Some(Call::Established(dialog)) => dialog == id,
            Some(Call::Outgoing { dialog, .. }) => dialog.as_ref() == Some(id),
            None => false,
        };
        if ours {
            self.call = None;
        }
    }

    // --- Incoming requests -----------------------------------------------------

    fn on_incoming_request(&mut self, mut request: IncomingRequest, now: Instant) {
        let from = request.from.as_ref().map(|from| from.uri.to_string()).unwrap_or_default();
        log::info!("incoming {} from {}", request.method, from);
        let reply = match request.method {
            Method::Options | Method::Message => Reply::new(200),
            Method::Invite => return self.on_incoming_invite(request, now),
            Method::Cancel => return,
            _ => Reply::new(405),
        };
        self.send_reply(&mut request, reply, now);
    }

    fn on_incoming_invite(&mut self, mut request: IncomingRequest, now: Instant) {
        if self.call.is_some() || !self.settings.auto_answer() {
            self.send_reply(&mut request, Reply::new(486), now);
            return;
        }
        let dialog = match self.stack.create_uas_dialog(&mut request, DialogState::Early) {
            Ok(dialog) => dialog,
            Err(e) => {
                log::warn!("cannot answer INVITE: {}", e);
                self.send_reply(&mut request, Reply::new(400), now);
                return;
            }
        };
        let ok = Reply::new(200).header(format!("Contact: <{}>", self.stack.config().contact));
        self.send_reply(&mut request, ok, now);
        if let Err(e) = self.stack.confirm_dialog(&dialog, None) {
            log::warn!("cannot confirm dialog {}: {}", dialog, e);
        }
        log::info!("call answered ({})", dialog);
        self.call = Some(Call::Established(dialog));
    }

    fn on_dialog_request(&mut self, dialog: SipDialogId, mut request: IncomingRequest, now: Instant) {
        log::debug!("{} in dialog {}", request.method, dialog);
        let reply = match request.method {
            Method::Ack => return,
            Method::Bye => {
                self.send_reply(&mut request, Reply::new(200), now);
                log::info!("remote hung up");
                self.stack.terminate_dialog(&dialog);
                self.forget_dialog(&dialog);
                return;
            }
            // No media to renegotiate.
            Method::Invite | Method::Update => Reply::new(488),
            _ => Reply::new(200),
        };
        self.send_reply(&mut request, reply, now);
    }

    fn send_reply(&mut self, request: &mut IncomingRequest, reply: Reply, now: Instant) {
        let code = reply.code;
        match self.stack.reply(request, reply, now) {
            Ok(true) => {}
            Ok(false) => log::debug!("{} to {} not sent", code, request.method),
            Err(e) => log::warn!("cannot reply {} to {}: {}", code, request.method, e),
        }
    }

    // --- Commands from the console ---------------------------------------------

    fn poll_commands(&mut self, now: Instant) -> bool {
        loop {
            match self.sip_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd, now),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    if self.quit_at.is_none() {
                        log::warn!("SIP command channel closed");
                        self.quit(now);
                    }
                    return true;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: SipCommand, now: Instant) {
        match cmd {
            SipCommand::Call(target) => self.start_call(&target, now),
            SipCommand::Hangup => self.hangup(now),
            SipCommand::Register => {
                self.registrator.register(&mut self.stack, now);
            }
            SipCommand::Unregister => {
                self.next_register = None;
                self.registrator.unregister(&mut self.stack, now);
            }
            SipCommand::Quit => self.quit(now),
        }
    }

    fn quit(&mut self, now: Instant) {
        if self.quit_at.is_some() {
            return;
        }
        if self.call.is_some() {
            self.hangup(now);
        }
        if self.registrator.state() == RegistrationState::Registered {
            self.registrator.unregister(&mut self.stack, now);
        }
        self.quit_at = Some(now + QUIT_GRACE);
    }
}

impl AppTask for SipTask {
    fn meta(&self) -> TaskMeta {
        TaskMeta {
            name: "sip",
            stack_bytes: Some(64 * 1024),
        }
    }

    fn into_runner(self: Box<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        Box::new(move || (*self).run())
    }
}

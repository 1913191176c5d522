use std::time::{Duration, Instant};

use crate::grammar::Parsed;
use crate::message::{IncomingResponse, Method, RequestParams, ResponseClass};
use crate::stack::{CoreEvent, RequestId, SipStack};
use crate::transport::Transport;
use crate::utils;

/// Lowest expiry accepted from a registrar.
const MIN_REGISTER_EXPIRES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationResult {
    Registered(u32),
    Unregistered,
    Failed(u16),
    RequestTimeout,
    TransportError,
}

/// REGISTER client. Owns the registration Call-ID and CSeq and works on top
/// of [`SipStack`]; the caller feeds it the stack's events.
#[derive(Debug)]
pub struct Registrator {
    state: RegistrationState,
    call_id: String,
    cseq: u32,
    expires: u32,
    last_expires: u32,
    pending: Option<RequestId>,
    unregistering: bool,
    retried_min_expires: bool,
    refresh_at: Option<Instant>,
}

impl Registrator {
    pub fn new<T: Transport>(stack: &SipStack<T>) -> Self {
        let config = stack.config();
        Self {
            state: RegistrationState::Unregistered,
            call_id: utils::new_call_id(&config.call_id_prefix),
            cseq: 0,
            expires: config.register_expires,
            last_expires: config.register_expires,
            pending: None,
            unregistering: false,
            retried_min_expires: false,
            refresh_at: None,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    /// Expiry granted by the registrar in the last successful REGISTER.
    pub fn last_expires(&self) -> u32 {
        self.last_expires
    }

    pub fn refresh_at(&self) -> Option<Instant> {
        self.refresh_at
    }

    pub fn pending(&self) -> Option<RequestId> {
        self.pending
    }

    pub fn register<T: Transport>(&mut self, stack: &mut SipStack<T>, now: Instant) -> RequestId {
        self.unregistering = false;
        self.retried_min_expires = false;
        self.send(stack, self.expires, now)
    }

    pub fn unregister<T: Transport>(&mut self, stack: &mut SipStack<T>, now: Instant) -> RequestId {
        self.unregistering = true;
        self.refresh_at = None;
        self.send(stack, 0, now)
    }

    /// True once a registration should be renewed.
    pub fn refresh_due(&self, now: Instant) -> bool {
        self.pending.is_none()
            && self.state == RegistrationState::Registered
            && self.refresh_at.is_some_and(|at| at <= now)
    }

    /// Seconds until renewal for a granted expiry: 80% of it.
    pub fn next_refresh_interval_secs(&self) -> u64 {
        let expires = self.last_expires.max(MIN_REGISTER_EXPIRES);
        (expires as u64 * 8) / 10
    }

    /// Consumes events for the outstanding REGISTER. Returns a result once
    /// the registration attempt is over.
    pub fn handle_event<T: Transport>(
        &mut self,
        stack: &mut SipStack<T>,
        event: &CoreEvent,
        now: Instant,
    ) -> Option<RegistrationResult> {
        let pending = self.pending?;
        match event {
            CoreEvent::Authenticated(id) if *id == pending => {
                self.cseq += 1;
                None
            }
            CoreEvent::Response { id, response } if *id == pending => self.on_response(stack, response, now),
            CoreEvent::RequestTimeout(id) if *id == pending => {
                self.fail();
                Some(RegistrationResult::RequestTimeout)
            }
            CoreEvent::TransportError(id) if *id == pending => {
                self.fail();
                Some(RegistrationResult::TransportError)
            }
            _ => None,
        }
    }

    fn send<T: Transport>(&mut self, stack: &mut SipStack<T>, expires: u32, now: Instant) -> RequestId {
        self.cseq += 1;
        self.state = RegistrationState::Registering;
        let config = stack.config();
        let extra_headers = vec![
            format!("Contact: <{}>;expires={}", config.contact, expires),
            format!("Expires: {}", expires),
        ];
        let request = stack.new_request(
            Method::Register,
            config.registrar(),
            RequestParams {
                to_uri: Some(config.uri.clone()),
                call_id: Some(self.call_id.clone()),
                cseq: Some(self.cseq),
                ..RequestParams::default()
            },
            extra_headers,
            None,
        );
        let id = stack.send_request(request, now);
        self.pending = Some(id);
        id
    }

    fn on_response<T: Transport>(
        &mut self,
        stack: &mut SipStack<T>,
        response: &IncomingResponse,
        now: Instant,
    ) -> Option<RegistrationResult> {
        match response.class() {
            ResponseClass::Provisional => None,
            ResponseClass::Success => {
                self.pending = None;
                if self.unregistering {
                    self.state = RegistrationState::Unregistered;
                    return Some(RegistrationResult::Unregistered);
                }
                let expires = granted_expires(response, stack.config().contact.user.as_deref())
                    .unwrap_or(self.expires)
                    .max(MIN_REGISTER_EXPIRES);
                self.last_expires = expires;
                self.state = RegistrationState::Registered;
                self.refresh_at = Some(now + Duration::from_secs(self.next_refresh_interval_secs()));
                log::info!("registered, expires in {}s", expires);
                Some(RegistrationResult::Registered(expires))
            }
            ResponseClass::Failure => {
                if response.status_code == 423 && !self.retried_min_expires {
                    if let Some(Parsed::Number(min)) = response.peek_header("Min-Expires", 0) {
                        log::debug!("423 Interval Too Brief, retrying with expires={}", min);
                        self.retried_min_expires = true;
                        self.expires = min;
                        self.send(stack, min, now);
                        return None;
                    }
                    log::warn!("423 response received for REGISTER without Min-Expires");
                }
                self.fail();
                Some(RegistrationResult::Failed(response.status_code))
            }
        }
    }

    fn fail(&mut self) {
        self.pending = None;
        self.refresh_at = None;
        self.state = RegistrationState::Error;
    }
}

/// Expiry from our own Contact in the 200, else the Expires header.
fn granted_expires(response: &IncomingResponse, contact_user: Option<&str>) -> Option<u32> {
    let from_contact = (0..response.count_header("Contact")).find_map(|idx| match response.peek_header("Contact", idx)? {
        Parsed::NameAddr(contact) if contact.uri.user.as_deref() == contact_user => {
            contact.params.get("expires")?.parse().ok()
        }
        _ => None,
    });
    from_contact.or_else(|| match response.peek_header("Expires", 0)? {
        Parsed::Number(expires) => Some(expires),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UaConfig;
    use crate::message::Message;
    use crate::parser::parse_message;
    use crate::transport::MemoryTransport;

    fn stack() -> SipStack<MemoryTransport> {
        let mut config = UaConfig::new("sip:alice@example.com".parse().unwrap());
        config.via_host = "client.invalid".into();
        config.contact = "sip:c0ntact@client.invalid".parse().unwrap();
        config.register_expires = 300;
        SipStack::new(config, MemoryTransport::reliable())
    }

    fn reply(stack: &mut SipStack<MemoryTransport>, code: u16, extra: &str, now: Instant) -> Vec<CoreEvent> {
        let sent = stack.transport().last_sent().unwrap().to_string();
        let Message::Request(request) = parse_message(&sent).unwrap() else {
            panic!("expected request");
        };
        let raw = format!(
            "SIP/2.0 {code} X\r\n\
             Via: {}\r\n\
             From: {}\r\n\
             To: {};tag=reg\r\n\
             Call-ID: {}\r\n\
             CSeq: {} REGISTER\r\n\
             {extra}\
             Content-Length: 0\r\n\r\n",
            request.header("Via").unwrap(),
            request.header("From").unwrap(),
            request.header("To").unwrap(),
            request.call_id,
            request.cseq,
        );
        stack.receive(&raw, now).unwrap();
        stack.take_events()
    }

    fn feed(reg: &mut Registrator, stack: &mut SipStack<MemoryTransport>, events: Vec<CoreEvent>, now: Instant) -> Option<RegistrationResult> {
        let mut result = None;
        for event in &events {
            result = reg.handle_event(stack, event, now).or(result);
        }
        result
    }

    #[test]
    fn registration_flow() {
        let now = Instant::now();
        let mut stack = stack();
        let mut reg = Registrator::new(&stack);
        reg.register(&mut stack, now);
        assert_eq!(reg.state(), RegistrationState::Registering);
        let sent = stack.transport().last_sent().unwrap();
        assert!(sent.starts_with("REGISTER sip:example.com SIP/2.0\r\n"));
        assert!(sent.contains("Contact: <sip:c0ntact@client.invalid>;expires=300\r\nExpires: 300\r\n"));
        assert!(sent.contains("To: <sip:alice@example.com>\r\n"));

        let events = reply(
            &mut stack,
            200,
            "Contact: <sip:other@192.0.2.1>;expires=50, <sip:c0ntact@client.invalid>;expires=120\r\nExpires: 90\r\n",
            now,
        );
        assert_eq!(feed(&mut reg, &mut stack, events, now), Some(RegistrationResult::Registered(120)));
        assert_eq!(reg.state(), RegistrationState::Registered);
        assert_eq!(reg.next_refresh_interval_secs(), 96);
        assert!(!reg.refresh_due(now + Duration::from_secs(95)));
        assert!(reg.refresh_due(now + Duration::from_secs(96)));

        reg.unregister(&mut stack, now);
        assert!(stack.transport().last_sent().unwrap().contains("Expires: 0\r\n"));
        let events = reply(&mut stack, 200, "", now);
        assert_eq!(feed(&mut reg, &mut stack, events, now), Some(RegistrationResult::Unregistered));
        assert_eq!(reg.state(), RegistrationState::Unregistered);
    }

    #[test]
    fn interval_too_brief_retries_once() {
        let now = Instant::now();
        let mut stack = stack();
        let mut reg = Registrator::new(&stack);
        reg.register(&mut stack, now);

        let events = reply(&mut stack, 423, "Min-Expires: 1800\r\n", now);
        assert_eq!(feed(&mut reg, &mut stack, events, now), None);
        let sent = stack.transport().last_sent().unwrap();
        assert!(sent.contains("CSeq: 2 REGISTER\r\n"));
        assert!(sent.contains("Expires: 1800\r\n"));

        let events = reply(&mut stack, 423, "Min-Expires: 3600\r\n", now);
        assert_eq!(feed(&mut reg, &mut stack, events, now), Some(RegistrationResult::Failed(423)));
        assert_eq!(reg.state(), RegistrationState::Error);
    }

    #[test]
    fn expiry_falls_back_to_header_then_config() {
        let now = Instant::now();
        let mut stack = stack();
        let mut reg = Registrator::new(&stack);
        reg.register(&mut stack, now);
        let events = reply(&mut stack, 200, "Expires: 5\r\n", now);
        assert_eq!(feed(&mut reg, &mut stack, events, now), Some(RegistrationResult::Registered(10)));

        reg.register(&mut stack, now);
        let events = reply(&mut stack, 200, "", now);
        assert_eq!(feed(&mut reg, &mut stack, events, now), Some(RegistrationResult::Registered(300)));
    }
}

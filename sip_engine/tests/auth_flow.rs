use std::time::Instant;

use sip_engine::auth::md5_hex;
use sip_engine::{
    parse_message, CoreEvent, MemoryTransport, Message, RegistrationResult, RegistrationState, Registrator, SipStack,
    UaConfig,
};

fn stack() -> SipStack<MemoryTransport> {
    let mut config = UaConfig::new("sip:alice@example.com".parse().unwrap()).with_password("secret");
    config.via_host = "alice.invalid".into();
    SipStack::new(config, MemoryTransport::reliable())
}

/// Registrar response to the last REGISTER on the wire.
fn registrar_responds(stack: &mut SipStack<MemoryTransport>, code: u16, extra: &str, now: Instant) -> Vec<CoreEvent> {
    let sent = stack.transport().last_sent().unwrap().to_string();
    let Message::Request(request) = parse_message(&sent).unwrap() else {
        panic!("expected request");
    };
    let raw = format!(
        "SIP/2.0 {code} X\r\n\
         Via: {}\r\n\
         From: {}\r\n\
         To: {};tag=registrar\r\n\
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

fn feed(
    reg: &mut Registrator,
    stack: &mut SipStack<MemoryTransport>,
    events: &[CoreEvent],
    now: Instant,
) -> Option<RegistrationResult> {
    let mut result = None;
    for event in events {
        result = reg.handle_event(stack, event, now).or(result);
    }
    result
}

const CHALLENGE: &str = "WWW-Authenticate: Digest realm=\"example.com\", nonce=\"abc123\", qop=\"auth\"\r\n";

#[test]
fn register_answers_one_challenge() {
    let now = Instant::now();
    let mut stack = stack();
    let mut reg = Registrator::new(&stack);
    reg.register(&mut stack, now);
    let first = stack.transport().last_sent().unwrap().to_string();
    assert!(!first.contains("Authorization:"));

    let events = registrar_responds(&mut stack, 401, CHALLENGE, now);
    assert!(matches!(events.as_slice(), [CoreEvent::Authenticated(_)]));
    assert_eq!(feed(&mut reg, &mut stack, &events, now), None);
    assert_eq!(stack.transport().sent().len(), 2);

    let second = stack.transport().last_sent().unwrap().to_string();
    assert!(second.contains("CSeq: 2 REGISTER\r\n"));
    assert!(second.contains("Authorization: Digest algorithm=MD5, username=\"alice\", realm=\"example.com\", nonce=\"abc123\", uri=\"sip:example.com\""));
    assert!(second.contains("qop=auth"));
    assert!(second.contains("nc=00000001"));
    let branch = |text: &str| text.lines().find(|l| l.starts_with("Via:")).unwrap().to_string();
    assert_ne!(branch(&first), branch(&second));

    // The realm and HA1 are kept for later challenges.
    let credentials = &stack.config().credentials;
    assert_eq!(credentials.realm.as_deref(), Some("example.com"));
    assert_eq!(credentials.ha1.as_deref(), Some(md5_hex(b"alice:example.com:secret").as_str()));

    let events = registrar_responds(&mut stack, 200, "Expires: 600\r\n", now);
    assert_eq!(feed(&mut reg, &mut stack, &events, now), Some(RegistrationResult::Registered(600)));
    assert_eq!(reg.state(), RegistrationState::Registered);

    // The refresh continues the CSeq sequence.
    reg.register(&mut stack, now);
    assert!(stack.transport().last_sent().unwrap().contains("CSeq: 3 REGISTER\r\n"));
}

#[test]
fn second_challenge_is_passed_through() {
    let now = Instant::now();
    let mut stack = stack();
    let mut reg = Registrator::new(&stack);
    reg.register(&mut stack, now);

    let events = registrar_responds(&mut stack, 401, CHALLENGE, now);
    feed(&mut reg, &mut stack, &events, now);
    let events = registrar_responds(&mut stack, 401, CHALLENGE, now);
    assert!(matches!(events.as_slice(), [CoreEvent::Response { response, .. }] if response.status_code == 401));
    assert_eq!(feed(&mut reg, &mut stack, &events, now), Some(RegistrationResult::Failed(401)));
    assert_eq!(reg.state(), RegistrationState::Error);
    assert_eq!(stack.transport().sent().len(), 2);
}

#[test]
fn challenge_without_credentials_fails() {
    let now = Instant::now();
    let mut config = UaConfig::new("sip:alice@example.com".parse().unwrap());
    config.via_host = "alice.invalid".into();
    let mut stack = SipStack::new(config, MemoryTransport::reliable());
    let mut reg = Registrator::new(&stack);
    reg.register(&mut stack, now);

    let events = registrar_responds(&mut stack, 407, &CHALLENGE.replace("WWW", "Proxy"), now);
    assert_eq!(feed(&mut reg, &mut stack, &events, now), Some(RegistrationResult::Failed(407)));
}

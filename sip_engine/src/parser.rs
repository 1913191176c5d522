use crate::grammar::{self, FirstLine, Parsed, Rule};
use crate::message::{IncomingMessage, IncomingRequest, IncomingResponse, Message};
use crate::{utils, Result, SipError};

/// Parses one complete frame into a request or response.
///
/// Headers the engine relies on are parsed eagerly and a malformed one fails
/// the whole message. Everything else is stored raw and parsed on demand.
pub fn parse_message(data: &str) -> Result<Message> {
    let first_end = data
        .find("\r\n")
        .ok_or(SipError::Invalid("no CRLF found, not a SIP message"))?;
    let first_line = match grammar::parse(&data[..first_end], Rule::FirstLine) {
        Some(Parsed::FirstLine(line)) => line,
        _ => {
            return Err(SipError::Parse(format!(
                "error parsing first line: {:?}",
                &data[..first_end]
            )))
        }
    };

    let mut message = IncomingMessage {
        data: data.to_string(),
        ..IncomingMessage::default()
    };

    let mut header_start = first_end + 2;
    let body_start = loop {
        match header_end(data, header_start) {
            HeaderEnd::Blank => break header_start + 2,
            HeaderEnd::Malformed => return Err(SipError::Invalid("malformed header block")),
            HeaderEnd::At(end) => {
                parse_header(&mut message, &data[header_start..end])?;
                header_start = end + 2;
            }
        }
    };

    let rest = &data[body_start..];
    message.body = match message.headers.peek("Content-Length", 0) {
        Some(Parsed::Number(len)) => utils::truncate_at_boundary(rest, len as usize).to_string(),
        _ => rest.to_string(),
    };

    match first_line {
        FirstLine::Request { method, uri } => Ok(Message::Request(IncomingRequest {
            method,
            ruri: uri,
            message,
        })),
        FirstLine::Response {
            status_code,
            reason_phrase,
        } => {
            let method = match message.headers.peek("CSeq", 0) {
                Some(Parsed::CSeq(cseq)) => cseq.method,
                _ => return Err(SipError::MissingHeader("CSeq")),
            };
            Ok(Message::Response(IncomingResponse {
                status_code,
                reason_phrase,
                method,
                message,
            }))
        }
    }
}

enum HeaderEnd {
    /// The empty line closing the header block starts here.
    Blank,
    Malformed,
    /// The header ends at this offset, folded continuation lines included.
    At(usize),
}

fn header_end(data: &str, start: usize) -> HeaderEnd {
    if data[start..].starts_with("\r\n") {
        return HeaderEnd::Blank;
    }
    let mut from = start;
    loop {
        let Some(offset) = data[from..].find("\r\n") else {
            return HeaderEnd::Malformed;
        };
        let end = from + offset;
        let next = &data[end + 2..];
        if next.starts_with(' ') || next.starts_with('\t') {
            from = end + 2;
            continue;
        }
        return HeaderEnd::At(end);
    }
}

fn parse_header(message: &mut IncomingMessage, line: &str) -> Result<()> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| SipError::Parse(format!("header without colon: {:?}", line)))?;
    let value = value
        .split("\r\n")
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let name = name.trim().to_ascii_lowercase();

    match name.as_str() {
        "via" | "v" => {
            for item in grammar::split_header_list(&value) {
                if message.via.is_none() {
                    let via = eager(&item, Rule::Via, "Via")?;
                    if let Parsed::Via(v) = &via {
                        message.via_branch = v.branch().map(str::to_string);
                        message.via = Some(v.clone());
                    }
                    message.headers.add_parsed("Via", item, via);
                } else {
                    message.headers.add("Via", item);
                }
            }
        }
        "from" | "f" => {
            let parsed = eager(&value, Rule::NameAddr, "From")?;
            if let Parsed::NameAddr(from) = &parsed {
                message.from_tag = from.tag().map(str::to_string);
                message.from = Some(from.clone());
            }
            message.headers.add_parsed("From", value, parsed);
        }
        "to" | "t" => {
            let parsed = eager(&value, Rule::NameAddr, "To")?;
            if let Parsed::NameAddr(to) = &parsed {
                message.to_tag = to.tag().map(str::to_string);
                message.to = Some(to.clone());
            }
            message.headers.add_parsed("To", value, parsed);
        }
        "record-route" => {
            for item in grammar::split_header_list(&value) {
                let parsed = eager(&item, Rule::NameAddr, "Record-Route")?;
                message.headers.add_parsed("Record-Route", item, parsed);
            }
        }
        "contact" | "m" => {
            for item in grammar::split_header_list(&value) {
                let parsed = eager(&item, Rule::Contact, "Contact")?;
                message.headers.add_parsed("Contact", item, parsed);
            }
        }
        "call-id" | "i" => {
            let parsed = eager(&value, Rule::CallId, "Call-ID")?;
            message.call_id = value.clone();
            message.headers.add_parsed("Call-ID", value, parsed);
        }
        "cseq" => {
            let parsed = eager(&value, Rule::CSeq, "CSeq")?;
            if let Parsed::CSeq(cseq) = &parsed {
                message.cseq = cseq.seq;
            }
            message.headers.add_parsed("CSeq", value, parsed);
        }
        "content-length" | "l" => single(message, "Content-Length", value, Rule::Number)?,
        "content-type" | "c" => single(message, "Content-Type", value, Rule::ContentType)?,
        "max-forwards" => single(message, "Max-Forwards", value, Rule::Number)?,
        "www-authenticate" => single(message, "WWW-Authenticate", value, Rule::Challenge)?,
        "proxy-authenticate" => single(message, "Proxy-Authenticate", value, Rule::Challenge)?,
        "session-expires" | "x" => single(message, "Session-Expires", value, Rule::SessionExpires)?,
        "refer-to" | "r" => single(message, "Refer-To", value, Rule::NameAddr)?,
        "replaces" => single(message, "Replaces", value, Rule::Replaces)?,
        "event" | "o" => single(message, "Event", value, Rule::Event)?,
        "remote-party-id" => single(message, "Remote-Party-Id", value, Rule::NameAddr)?,
        _ => message.headers.add(&name, value),
    }
    Ok(())
}

fn eager(value: &str, rule: Rule, name: &str) -> Result<Parsed> {
    grammar::parse(value, rule)
        .ok_or_else(|| SipError::Parse(format!("error parsing {} header: {:?}", name, value)))
}

fn single(message: &mut IncomingMessage, name: &str, value: String, rule: Rule) -> Result<()> {
    let parsed = eager(&value, rule, name)?;
    message.headers.add_parsed(name, value, parsed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UaConfig;
    use crate::message::{Method, OutgoingRequest, RequestParams};

    const INVITE: &str = "INVITE sip:bob@biloxi.com SIP/2.0\r\n\
        v: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds, SIP/2.0/UDP proxy.atlanta.com;branch=z9hG4bKp1\r\n\
        Max-Forwards: 70\r\n\
        t: Bob <sip:bob@biloxi.com>\r\n\
        f: Alice\r\n <sip:alice@atlanta.com>;tag=1928301774\r\n\
        i: a84b4c76e66710@pc33.atlanta.com\r\n\
        CSeq: 314159 INVITE\r\n\
        m: <sip:alice@pc33.atlanta.com>\r\n\
        Subject: lunch\r\n\
        c: application/sdp\r\n\
        l: 4\r\n\
        \r\n\
        v=0\r\nextra";

    #[test]
    fn parses_request_with_compact_and_folded_headers() {
        let request = match parse_message(INVITE).unwrap() {
            Message::Request(request) => request,
            Message::Response(_) => panic!("expected request"),
        };
        assert_eq!(request.method, Method::Invite);
        assert_eq!(request.ruri.to_string(), "sip:bob@biloxi.com");
        assert_eq!(request.call_id, "a84b4c76e66710@pc33.atlanta.com");
        assert_eq!(request.cseq, 314159);
        assert_eq!(request.from_tag.as_deref(), Some("1928301774"));
        assert_eq!(request.from.as_ref().unwrap().display_name.as_deref(), Some("Alice"));
        assert_eq!(request.to_tag, None);
        assert_eq!(request.via_branch.as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(request.count_header("Via"), 2);
        assert_eq!(request.header("Subject"), Some("lunch"));
        assert_eq!(request.content_type().as_deref(), Some("application/sdp"));
        assert_eq!(request.contact_uri().unwrap().host, "pc33.atlanta.com");
        // Content-Length bounds the body.
        assert_eq!(request.body, "v=0\r");
    }

    #[test]
    fn parses_response_and_takes_method_from_cseq() {
        let raw = "SIP/2.0 401 Unauthorized\r\n\
            Via: SIP/2.0/UDP host.invalid;branch=z9hG4bKabc\r\n\
            To: <sip:alice@example.com>;tag=srv\r\n\
            From: <sip:alice@example.com>;tag=cli\r\n\
            Call-ID: x1\r\n\
            CSeq: 2 REGISTER\r\n\
            WWW-Authenticate: Digest realm=\"example.com\", nonce=\"abc123\", qop=\"auth\"\r\n\
            \r\n";
        let mut response = match parse_message(raw).unwrap() {
            Message::Response(response) => response,
            Message::Request(_) => panic!("expected response"),
        };
        assert_eq!(response.status_code, 401);
        assert_eq!(response.reason_phrase, "Unauthorized");
        assert_eq!(response.method, Method::Register);
        assert_eq!(response.to_tag.as_deref(), Some("srv"));
        assert_eq!(response.body, "");
        let challenge = response
            .parse_header("www-authenticate", 0)
            .and_then(Parsed::as_challenge)
            .cloned()
            .unwrap();
        assert_eq!(challenge.nonce.as_deref(), Some("abc123"));
    }

    #[test]
    fn rejects_broken_frames() {
        assert!(parse_message("garbage without line end").is_err());
        assert!(parse_message("HELLO\r\n\r\n").is_err());
        // Header block never terminated.
        assert!(parse_message("OPTIONS sip:a@b.com SIP/2.0\r\nVia: SIP/2.0/UDP h;branch=z9hG4bK1").is_err());
        // Eagerly parsed header that does not match its grammar.
        let bad_cseq = "OPTIONS sip:a@b.com SIP/2.0\r\nCSeq: one OPTIONS\r\n\r\n";
        assert!(matches!(parse_message(bad_cseq), Err(SipError::Parse(_))));
        let no_colon = "OPTIONS sip:a@b.com SIP/2.0\r\nBogus header\r\n\r\n";
        assert!(parse_message(no_colon).is_err());
        let response_without_cseq = "SIP/2.0 200 OK\r\nCall-ID: x\r\n\r\n";
        assert_eq!(
            parse_message(response_without_cseq).unwrap_err(),
            SipError::MissingHeader("CSeq")
        );
    }

    #[test]
    fn body_without_content_length_runs_to_end() {
        let raw = "MESSAGE sip:a@b.com SIP/2.0\r\nCSeq: 1 MESSAGE\r\n\r\nhello\r\nworld";
        match parse_message(raw).unwrap() {
            Message::Request(request) => assert_eq!(request.body, "hello\r\nworld"),
            Message::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn rendered_request_parses_back_unchanged() {
        let config = UaConfig::new("sip:alice@atlanta.com".parse().unwrap());
        let body = "v=0\r\no=- 1 1 IN IP4 192.0.2.1\r\ns=caf\u{e9}\r\n";
        let mut outgoing = OutgoingRequest::new(
            Method::Invite,
            "sip:bob@biloxi.com".parse().unwrap(),
            &config,
            RequestParams {
                route_set: Some(vec![
                    "<sip:p1.example.com;lr>".into(),
                    "<sip:p2.example.com;lr>".into(),
                ]),
                ..RequestParams::default()
            },
            vec!["Contact: <sip:alice@192.0.2.1>".into()],
            Some(body.into()),
        );
        outgoing.headers.set_first("Via", "SIP/2.0/UDP 192.0.2.1;branch=z9hG4bKfirst");
        outgoing.headers.add("Via", "SIP/2.0/UDP 192.0.2.9;branch=z9hG4bKsecond");

        let text = outgoing.to_string();
        let request = match parse_message(&text).unwrap() {
            Message::Request(request) => request,
            Message::Response(_) => panic!("expected request"),
        };
        assert_eq!(request.method, Method::Invite);
        assert_eq!(request.ruri, outgoing.ruri);
        assert_eq!(
            request.header_values("Via"),
            [
                "SIP/2.0/UDP 192.0.2.1;branch=z9hG4bKfirst",
                "SIP/2.0/UDP 192.0.2.9;branch=z9hG4bKsecond",
            ]
        );
        assert_eq!(
            request.header_values("Route"),
            ["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"]
        );
        assert_eq!(request.call_id, outgoing.call_id);
        assert_eq!(request.cseq, outgoing.cseq);
        assert_eq!(request.from_tag.as_deref(), outgoing.from_tag());
        assert_eq!(request.body.as_bytes(), body.as_bytes());
        assert_eq!(request.data, text);
    }

    #[test]
    fn response_serializes_back_from_its_headers() {
        let raw = "SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 192.0.2.1;branch=z9hG4bKone\r\n\
            Via: SIP/2.0/UDP 192.0.2.9;branch=z9hG4bKtwo\r\n\
            Record-Route: <sip:p1.example.com;lr>\r\n\
            Record-Route: <sip:p2.example.com;lr>\r\n\
            From: <sip:alice@atlanta.com>;tag=a1\r\n\
            To: <sip:bob@biloxi.com>;tag=b1\r\n\
            Call-ID: rt1\r\n\
            CSeq: 3 INVITE\r\n\
            Contact: <sip:bob@192.0.2.4>\r\n\
            Content-Type: application/sdp\r\n\
            Content-Length: 10\r\n\
            \r\n\
            v=0\r\ns=-\r\n";
        let response = match parse_message(raw).unwrap() {
            Message::Response(response) => response,
            Message::Request(_) => panic!("expected response"),
        };
        assert_eq!(response.status_code, 200);
        assert_eq!(response.method, Method::Invite);
        assert_eq!(response.data, raw);

        let mut rebuilt = format!("SIP/2.0 {} {}\r\n", response.status_code, response.reason_phrase);
        for (name, value) in response.headers.iter() {
            rebuilt.push_str(&format!("{}: {}\r\n", name, value));
        }
        rebuilt.push_str("\r\n");
        rebuilt.push_str(&response.body);
        assert_eq!(rebuilt, raw);
    }
}

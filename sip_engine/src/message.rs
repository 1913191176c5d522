use core::fmt;
use core::ops::{Deref, DerefMut};
use core::str::FromStr;

use crate::config::UaConfig;
use crate::constants::{self, ACCEPTED_BODY_TYPES, ALLOWED_METHODS, MAX_FORWARDS};
use crate::grammar::{self, NameAddr, Parsed, Uri, Via};
use crate::{utils, Result, SipError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Update,
    Info,
    Message,
    Subscribe,
    Notify,
    Refer,
    Prack,
    Publish,
    Extension(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Update => "UPDATE",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Prack => "PRACK",
            Method::Publish => "PUBLISH",
            Method::Extension(name) => name,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "UPDATE" => Method::Update,
            "INFO" => Method::Info,
            "MESSAGE" => Method::Message,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "PRACK" => Method::Prack,
            "PUBLISH" => Method::Publish,
            other if grammar::is_token(other) => Method::Extension(other.to_string()),
            _ => return Err(SipError::Invalid("method")),
        })
    }
}

/// Canonical form of a header name. Compact forms are expanded.
pub fn headerize(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    let expanded = match lower.as_str() {
        "i" => "call-id",
        "m" => "contact",
        "e" => "content-encoding",
        "l" => "content-length",
        "c" => "content-type",
        "f" => "from",
        "s" => "subject",
        "k" => "supported",
        "t" => "to",
        "v" => "via",
        "o" => "event",
        "r" => "refer-to",
        "x" => "session-expires",
        "u" => "allow-events",
        "b" => "referred-by",
        "a" => "accept-contact",
        "j" => "reject-contact",
        "d" => "request-disposition",
        "y" => "identity",
        "n" => "identity-info",
        other => other,
    };
    match expanded {
        "call-id" => "Call-ID".to_string(),
        "cseq" => "CSeq".to_string(),
        "www-authenticate" => "WWW-Authenticate".to_string(),
        _ => expanded
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join("-"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderValue {
    raw: String,
    parsed: Option<Parsed>,
}

impl HeaderValue {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn parsed(&self) -> Option<&Parsed> {
        self.parsed.as_ref()
    }
}

/// Multi-valued header map keyed by canonical name, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, Vec<HeaderValue>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    fn entry(&mut self, name: String) -> &mut Vec<HeaderValue> {
        let idx = match self.position(&name) {
            Some(idx) => idx,
            None => {
                self.fields.push((name, Vec::new()));
                self.fields.len() - 1
            }
        };
        &mut self.fields[idx].1
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.entry(headerize(name)).push(HeaderValue {
            raw: value.into(),
            parsed: None,
        });
    }

    pub(crate) fn add_parsed(&mut self, name: &str, value: impl Into<String>, parsed: Parsed) {
        self.entry(headerize(name)).push(HeaderValue {
            raw: value.into(),
            parsed: Some(parsed),
        });
    }

    /// Replaces every value of `name` with `value`, keeping the header's
    /// position.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let values = self.entry(headerize(name));
        values.clear();
        values.push(HeaderValue {
            raw: value.into(),
            parsed: None,
        });
    }

    /// Replaces `name` and moves it to the top of the header block.
    pub fn set_first(&mut self, name: &str, value: impl Into<String>) {
        let name = headerize(name);
        self.fields.retain(|(n, _)| *n != name);
        let value = HeaderValue {
            raw: value.into(),
            parsed: None,
        };
        self.fields.insert(0, (name, vec![value]));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = headerize(name);
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, values)| values.first())
            .map(HeaderValue::raw)
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        let name = headerize(name);
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, values)| values.iter().map(HeaderValue::raw).collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.count(name) > 0
    }

    pub fn count(&self, name: &str) -> usize {
        let name = headerize(name);
        self.fields
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(0, |(_, values)| values.len())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let name = headerize(name);
        let before = self.fields.len();
        self.fields.retain(|(n, _)| *n != name);
        before != self.fields.len()
    }

    /// Parsed form of the `idx`-th value of `name`, computed on first use and
    /// memoized. A value that fails its rule is dropped from the map.
    pub fn parse(&mut self, name: &str, idx: usize) -> Option<&Parsed> {
        let name = headerize(name);
        let rule = grammar::rule_for(&name)?;
        let pos = self.position(&name)?;
        let values = &mut self.fields[pos].1;
        let value = values.get_mut(idx)?;
        if value.parsed.is_none() {
            match grammar::parse(&value.raw, rule) {
                Some(parsed) => value.parsed = Some(parsed),
                None => {
                    log::debug!("dropping malformed {} header: {:?}", name, value.raw);
                    values.remove(idx);
                    if values.is_empty() {
                        self.fields.remove(pos);
                    }
                    return None;
                }
            }
        }
        self.fields[pos].1[idx].parsed.as_ref()
    }

    /// Like [`Headers::parse`] but without caching or dropping anything.
    pub fn peek(&self, name: &str, idx: usize) -> Option<Parsed> {
        let name = headerize(name);
        let (_, values) = self.fields.iter().find(|(n, _)| *n == name)?;
        let value = values.get(idx)?;
        match &value.parsed {
            Some(parsed) => Some(parsed.clone()),
            None => grammar::parse(&value.raw, grammar::rule_for(&name)?),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.raw())))
    }
}

/// Fields shared by inbound requests and responses.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    /// The frame exactly as received.
    pub data: String,
    pub headers: Headers,
    pub body: String,
    pub call_id: String,
    pub cseq: u32,
    pub from: Option<NameAddr>,
    pub from_tag: Option<String>,
    pub to: Option<NameAddr>,
    pub to_tag: Option<String>,
    /// Topmost Via.
    pub via: Option<Via>,
    pub via_branch: Option<String>,
}

impl IncomingMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers.get_all(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.has(name)
    }

    pub fn count_header(&self, name: &str) -> usize {
        self.headers.count(name)
    }

    pub fn parse_header(&mut self, name: &str, idx: usize) -> Option<&Parsed> {
        self.headers.parse(name, idx)
    }

    pub fn peek_header(&self, name: &str, idx: usize) -> Option<Parsed> {
        self.headers.peek(name, idx)
    }

    /// URI of the first Contact, if any.
    pub fn contact_uri(&self) -> Option<Uri> {
        match self.peek_header("Contact", 0)? {
            Parsed::NameAddr(addr) => Some(addr.uri),
            _ => None,
        }
    }

    pub fn content_type(&self) -> Option<String> {
        match self.peek_header("Content-Type", 0)? {
            Parsed::ContentType(ct) => Some(ct.media_type),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Provisional,
    Success,
    Failure,
}

impl ResponseClass {
    pub fn of(code: u16) -> Self {
        match code {
            100..=199 => ResponseClass::Provisional,
            200..=299 => ResponseClass::Success,
            _ => ResponseClass::Failure,
        }
    }
}

/// Response the application wants to send for an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub reason: Option<String>,
    pub extra_headers: Vec<String>,
    pub body: Option<String>,
}

impl Reply {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn header(mut self, header: impl Into<String>) -> Self {
        self.extra_headers.push(header.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    pub ruri: Uri,
    pub message: IncomingMessage,
}

impl Deref for IncomingRequest {
    type Target = IncomingMessage;

    fn deref(&self) -> &IncomingMessage {
        &self.message
    }
}

impl DerefMut for IncomingRequest {
    fn deref_mut(&mut self) -> &mut IncomingMessage {
        &mut self.message
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

fn push_body(out: &mut String, body: Option<&str>) {
    let body = body.unwrap_or("");
    push_header(out, "Content-Length", &body.len().to_string());
    out.push_str("\r\n");
    out.push_str(body);
}

fn has_extra_header(extra: &[String], name: &str) -> bool {
    extra.iter().any(|h| {
        h.split_once(':')
            .is_some_and(|(n, _)| headerize(n) == name)
    })
}

impl IncomingRequest {
    /// Generates this request's local tag if it has none yet.
    pub fn ensure_to_tag(&mut self) -> &str {
        self.message.to_tag.get_or_insert_with(utils::new_tag)
    }

    /// Serializes a response. Anything above 100 gets a To-tag, generated
    /// once and reused for later responses to the same request.
    pub fn build_response(&mut self, reply: &Reply, session_timers: bool) -> Result<String> {
        let code = reply.code;
        if !(100..=699).contains(&code) {
            return Err(SipError::InvalidStatusCode(code));
        }
        if code > 100 {
            self.ensure_to_tag();
        }
        let reason = reply
            .reason
            .as_deref()
            .unwrap_or_else(|| constants::reason_phrase(code));

        let mut out = format!("SIP/2.0 {} {}\r\n", code, reason);
        if self.method == Method::Invite && code > 100 && code <= 200 {
            for route in self.headers.get_all("Record-Route") {
                push_header(&mut out, "Record-Route", route);
            }
        }
        self.push_dialog_headers(&mut out, self.to_tag.as_deref());

        for header in &reply.extra_headers {
            out.push_str(header.trim());
            out.push_str("\r\n");
        }

        if self.method == Method::Options {
            push_header(&mut out, "Allow", ALLOWED_METHODS);
            push_header(&mut out, "Accept", ACCEPTED_BODY_TYPES);
        } else if code == 405 {
            push_header(&mut out, "Allow", ALLOWED_METHODS);
        } else if code == 415 {
            push_header(&mut out, "Accept", ACCEPTED_BODY_TYPES);
        }
        push_header(&mut out, "Supported", &constants::supported(&self.method, session_timers));

        if reply.body.is_some() && !has_extra_header(&reply.extra_headers, "Content-Type") {
            push_header(&mut out, "Content-Type", "application/sdp");
        }
        push_body(&mut out, reply.body.as_deref());
        Ok(out)
    }

    /// Serializes a minimal stateless response (no body, no Supported).
    pub fn reply_sl(&self, code: u16, reason: Option<&str>) -> Result<String> {
        if !(100..=699).contains(&code) {
            return Err(SipError::InvalidStatusCode(code));
        }
        let reason = reason.unwrap_or_else(|| constants::reason_phrase(code));
        let mut out = format!("SIP/2.0 {} {}\r\n", code, reason);
        let tag = match &self.to_tag {
            Some(tag) => Some(tag.clone()),
            None if code > 100 => Some(utils::new_tag()),
            None => None,
        };
        self.push_dialog_headers(&mut out, tag.as_deref());
        push_body(&mut out, None);
        Ok(out)
    }

    /// Via, To, From, Call-ID and CSeq copied from the request.
    fn push_dialog_headers(&self, out: &mut String, to_tag: Option<&str>) {
        for via in self.headers.get_all("Via") {
            push_header(out, "Via", via);
        }
        let mut to = self.headers.get("To").unwrap_or_default().to_string();
        let to_has_tag = self.to.as_ref().is_some_and(|to| to.tag().is_some());
        if let (Some(tag), false) = (to_tag, to_has_tag) {
            to.push_str(";tag=");
            to.push_str(tag);
        }
        push_header(out, "To", &to);
        push_header(out, "From", self.headers.get("From").unwrap_or_default());
        push_header(out, "Call-ID", &self.call_id);
        push_header(out, "CSeq", &format!("{} {}", self.cseq, self.method));
    }
}

#[derive(Debug, Clone)]
pub struct IncomingResponse {
    pub status_code: u16,
    pub reason_phrase: String,
    /// Method from CSeq.
    pub method: Method,
    pub message: IncomingMessage,
}

impl IncomingResponse {
    pub fn class(&self) -> ResponseClass {
        ResponseClass::of(self.status_code)
    }
}

impl Deref for IncomingResponse {
    type Target = IncomingMessage;

    fn deref(&self) -> &IncomingMessage {
        &self.message
    }
}

impl DerefMut for IncomingResponse {
    fn deref_mut(&mut self) -> &mut IncomingMessage {
        &mut self.message
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Request(IncomingRequest),
    Response(IncomingResponse),
}

/// Optional inputs to [`OutgoingRequest::new`]. Unset fields fall back to
/// the configured identity or freshly generated values.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    /// When set (even empty) it replaces the preloaded route.
    pub route_set: Option<Vec<String>>,
    pub to_uri: Option<Uri>,
    pub to_display_name: Option<String>,
    pub to_tag: Option<String>,
    pub from_uri: Option<Uri>,
    pub from_display_name: Option<String>,
    pub from_tag: Option<String>,
    pub call_id: Option<String>,
    pub cseq: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub ruri: Uri,
    pub headers: Headers,
    /// Raw `Name: value` lines appended after the standard headers.
    pub extra_headers: Vec<String>,
    pub body: Option<String>,
    pub call_id: String,
    pub cseq: u32,
    pub from: NameAddr,
    pub to: NameAddr,
    session_timers: bool,
    user_agent: String,
}

impl OutgoingRequest {
    pub fn new(
        method: Method,
        ruri: Uri,
        config: &UaConfig,
        params: RequestParams,
        extra_headers: Vec<String>,
        body: Option<String>,
    ) -> Self {
        let mut headers = Headers::new();
        match params.route_set {
            Some(routes) => {
                for route in routes {
                    headers.add("Route", route);
                }
            }
            None => {
                if let (true, Some(proxy)) = (config.use_preloaded_route, &config.outbound_proxy) {
                    headers.add("Route", format!("<{};lr>", proxy));
                }
            }
        }
        headers.set("Max-Forwards", MAX_FORWARDS.to_string());

        let mut to = NameAddr::new(params.to_uri.unwrap_or_else(|| ruri.clone()))
            .with_display_name(params.to_display_name);
        if let Some(tag) = &params.to_tag {
            to.set_tag(tag);
        }
        headers.set("To", to.to_string());

        let mut from = NameAddr::new(params.from_uri.unwrap_or_else(|| config.uri.clone()))
            .with_display_name(params.from_display_name.or_else(|| config.display_name.clone()));
        from.set_tag(&params.from_tag.unwrap_or_else(utils::new_tag));
        headers.set("From", from.to_string());

        let call_id = params
            .call_id
            .unwrap_or_else(|| utils::new_call_id(&config.call_id_prefix));
        headers.set("Call-ID", call_id.clone());

        let cseq = params.cseq.unwrap_or_else(utils::initial_cseq);
        headers.set("CSeq", format!("{} {}", cseq, method));

        Self {
            method,
            ruri,
            headers,
            extra_headers,
            body,
            call_id,
            cseq,
            from,
            to,
            session_timers: config.session_timers,
            user_agent: config.user_agent.clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let canonical = headerize(name);
        self.headers.get(&canonical).or_else(|| {
            self.extra_headers.iter().find_map(|h| {
                let (n, v) = h.split_once(':')?;
                (headerize(n) == canonical).then(|| v.trim())
            })
        })
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn set_cseq(&mut self, cseq: u32) {
        self.cseq = cseq;
        self.headers.set("CSeq", format!("{} {}", cseq, self.method));
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from.tag()
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.tag()
    }

    /// Branch of the topmost Via, once a transaction has stamped one.
    pub fn branch(&self) -> Option<String> {
        match self.headers.peek("Via", 0)? {
            Parsed::Via(via) => via.branch().map(str::to_string),
            _ => None,
        }
    }

    /// ACK for a non-2xx final response, sharing the INVITE's Via branch.
    pub fn non_2xx_ack(&self, response: &IncomingResponse) -> Self {
        let mut ack = self.derive(Method::Ack);
        if let Some(to) = response.header("To") {
            ack.headers.set("To", to);
        }
        if let Some(to) = &response.to {
            ack.to = to.clone();
        }
        ack
    }

    /// CANCEL matching this INVITE. The transaction sending it must reuse
    /// the INVITE's branch.
    pub fn cancel_request(&self, reason: Option<&str>) -> Self {
        let mut cancel = self.derive(Method::Cancel);
        if let Some(reason) = reason {
            cancel.headers.add("Reason", reason);
        }
        cancel
    }

    fn derive(&self, method: Method) -> Self {
        let mut headers = Headers::new();
        for name in ["Via", "Route", "Max-Forwards", "To", "From", "Call-ID"] {
            for value in self.headers.get_all(name) {
                headers.add(name, value);
            }
        }
        headers.set("CSeq", format!("{} {}", self.cseq, method));
        Self {
            method,
            ruri: self.ruri.clone(),
            headers,
            extra_headers: Vec::new(),
            body: None,
            call_id: self.call_id.clone(),
            cseq: self.cseq,
            from: self.from.clone(),
            to: self.to.clone(),
            session_timers: self.session_timers,
            user_agent: self.user_agent.clone(),
        }
    }
}

impl fmt::Display for OutgoingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n", self.method, self.ruri)?;
        for (name, value) in self.headers.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        for header in &self.extra_headers {
            write!(f, "{}\r\n", header.trim())?;
        }
        write!(f, "Allow: {}\r\n", ALLOWED_METHODS)?;
        write!(
            f,
            "Supported: {}\r\n",
            constants::supported(&self.method, self.session_timers)
        )?;
        write!(f, "User-Agent: {}\r\n", self.user_agent)?;
        match &self.body {
            Some(body) => {
                if !self.has_header("Content-Type") {
                    write!(f, "Content-Type: application/sdp\r\n")?;
                }
                write!(f, "Content-Length: {}\r\n\r\n{}", body.len(), body)
            }
            None => write!(f, "Content-Length: 0\r\n\r\n"),
        }
    }
}

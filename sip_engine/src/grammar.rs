//! Grammar rules for the header values the engine inspects.
//!
//! [`parse`] is the single entry point. It returns `None` when the text does
//! not match the rule, which callers treat as a malformed header.

use core::fmt;
use core::str::FromStr;

use crate::message::Method;
use crate::SipError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    FirstLine,
    Uri,
    NameAddr,
    /// Name-addr or the `*` wildcard.
    Contact,
    Via,
    CSeq,
    Challenge,
    Number,
    CallId,
    ContentType,
    SessionExpires,
    Event,
    Replaces,
}

/// Rule used to parse values of the canonical header `name`.
pub fn rule_for(name: &str) -> Option<Rule> {
    match name {
        "Via" => Some(Rule::Via),
        "From" | "To" | "Route" | "Record-Route" | "Refer-To" | "Referred-By"
        | "Remote-Party-Id" | "P-Asserted-Identity" => Some(Rule::NameAddr),
        "Contact" => Some(Rule::Contact),
        "CSeq" => Some(Rule::CSeq),
        "WWW-Authenticate" | "Proxy-Authenticate" => Some(Rule::Challenge),
        "Content-Length" | "Max-Forwards" | "Expires" | "Min-Expires" => Some(Rule::Number),
        "Call-ID" => Some(Rule::CallId),
        "Content-Type" => Some(Rule::ContentType),
        "Session-Expires" => Some(Rule::SessionExpires),
        "Event" => Some(Rule::Event),
        "Replaces" => Some(Rule::Replaces),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    FirstLine(FirstLine),
    Uri(Uri),
    NameAddr(NameAddr),
    Via(Via),
    CSeq(CSeq),
    Challenge(Challenge),
    Number(u32),
    Token(String),
    ContentType(ContentType),
    SessionExpires(SessionExpires),
    Event(EventHeader),
    Replaces(Replaces),
}

impl Parsed {
    pub fn as_name_addr(&self) -> Option<&NameAddr> {
        match self {
            Parsed::NameAddr(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_via(&self) -> Option<&Via> {
        match self {
            Parsed::Via(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_cseq(&self) -> Option<&CSeq> {
        match self {
            Parsed::CSeq(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_challenge(&self) -> Option<&Challenge> {
        match self {
            Parsed::Challenge(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u32> {
        match self {
            Parsed::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<&str> {
        match self {
            Parsed::Token(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_content_type(&self) -> Option<&ContentType> {
        match self {
            Parsed::ContentType(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_session_expires(&self) -> Option<&SessionExpires> {
        match self {
            Parsed::SessionExpires(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&EventHeader> {
        match self {
            Parsed::Event(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_replaces(&self) -> Option<&Replaces> {
        match self {
            Parsed::Replaces(v) => Some(v),
            _ => None,
        }
    }
}

pub fn parse(text: &str, rule: Rule) -> Option<Parsed> {
    let text = text.trim();
    match rule {
        Rule::FirstLine => parse_first_line(text).map(Parsed::FirstLine),
        Rule::Uri => Uri::parse(text).map(Parsed::Uri),
        Rule::NameAddr => NameAddr::parse(text).map(Parsed::NameAddr),
        Rule::Contact if text == "*" => Some(Parsed::Token("*".into())),
        Rule::Contact => NameAddr::parse(text).map(Parsed::NameAddr),
        Rule::Via => Via::parse(text).map(Parsed::Via),
        Rule::CSeq => CSeq::parse(text).map(Parsed::CSeq),
        Rule::Challenge => Challenge::parse(text).map(Parsed::Challenge),
        Rule::Number => parse_number(text).map(Parsed::Number),
        Rule::CallId => {
            (!text.is_empty() && !text.contains(char::is_whitespace)).then(|| Parsed::Token(text.into()))
        }
        Rule::ContentType => ContentType::parse(text).map(Parsed::ContentType),
        Rule::SessionExpires => SessionExpires::parse(text).map(Parsed::SessionExpires),
        Rule::Event => EventHeader::parse(text).map(Parsed::Event),
        Rule::Replaces => Replaces::parse(text).map(Parsed::Replaces),
    }
}

/// Splits a comma separated header list, leaving commas inside quotes and
/// angle brackets alone.
pub fn split_header_list(text: &str) -> Vec<String> {
    split_outside(text, ',')
        .into_iter()
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_outside(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut angle = 0usize;
    for (i, c) in text.char_indices() {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quotes = false;
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '<' => angle += 1,
            '>' => angle = angle.saturating_sub(1),
            c if c == sep && angle == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

pub(crate) fn is_token(text: &str) -> bool {
    !text.is_empty() && text.chars().all(is_token_char)
}

fn parse_number(text: &str) -> Option<u32> {
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Index of the quote closing the quoted-string that opens `text`.
fn closing_quote(text: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in text.char_indices().skip(1) {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some(i);
        }
    }
    None
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn unquote(text: &str) -> Option<String> {
    if text.len() >= 2 && text.starts_with('"') && closing_quote(text) == Some(text.len() - 1) {
        Some(unescape(&text[1..text.len() - 1]))
    } else {
        None
    }
}

fn parse_hostport(text: &str) -> Option<(String, Option<u16>)> {
    if let Some(rest) = text.strip_prefix('[') {
        let (addr, after) = rest.split_once(']')?;
        if addr.is_empty() {
            return None;
        }
        let port = match after {
            "" => None,
            _ => Some(after.strip_prefix(':')?.parse().ok()?),
        };
        return Some((format!("[{}]", addr.to_ascii_lowercase()), port));
    }
    let (host, port) = match text.rsplit_once(':') {
        Some((host, port)) => (host, Some(port.parse().ok()?)),
        None => (text, None),
    };
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| !c.is_whitespace() && !"<>\"@;?,[]".contains(c));
    valid.then(|| (host.to_ascii_lowercase(), port))
}

/// Ordered `;name[=value]` parameters. Names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `name`. Flag parameters yield an empty string.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn set(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(str::to_string);
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    /// Parses the text following the first `;`.
    fn parse(text: &str) -> Option<Self> {
        let mut params = Vec::new();
        for segment in split_outside(text, ';') {
            let segment = segment.trim();
            let (name, value) = match segment.split_once('=') {
                Some((name, value)) => {
                    let value = value.trim();
                    if value.is_empty() || (value.contains(char::is_whitespace) && !value.starts_with('"')) {
                        return None;
                    }
                    (name.trim(), Some(value.to_string()))
                }
                None => (segment, None),
            };
            if !is_token(name) {
                return None;
            }
            params.push((name.to_string(), value));
        }
        Some(Self(params))
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    /// Raw `?header=value` section, without the question mark.
    pub headers: Option<String>,
}

impl Uri {
    pub fn new(scheme: &str, user: Option<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            user,
            host: host.into(),
            port,
            params: Params::new(),
            headers: None,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() || text.contains(char::is_whitespace) {
            return None;
        }
        let (scheme, rest) = text.split_once(':')?;
        let mut chars = scheme.chars();
        let scheme_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c));
        if !scheme_ok {
            return None;
        }
        let (main, headers) = match rest.split_once('?') {
            Some((main, headers)) => (main, Some(headers.to_string())),
            None => (rest, None),
        };
        let (userhost, params) = match main.split_once(';') {
            Some((userhost, params)) => (userhost, Params::parse(params)?),
            None => (main, Params::new()),
        };
        let (user, hostport) = match userhost.rsplit_once('@') {
            Some(("", _)) => return None,
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, userhost),
        };
        let (host, port) = parse_hostport(hostport)?;
        Some(Self {
            scheme: scheme.to_ascii_lowercase(),
            user,
            host,
            port,
            params,
            headers,
        })
    }
}

impl FromStr for Uri {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uri::parse(s).ok_or_else(|| SipError::Parse(format!("invalid URI: {}", s)))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        if let Some(headers) = &self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

/// `["display"] <uri>;params` as found in From, To, Contact and routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: Option<String>) -> Self {
        self.display_name = display_name.filter(|name| !name.is_empty());
        self
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag").filter(|tag| !tag.is_empty())
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.params.set("tag", Some(tag));
    }

    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (display_name, rest) = if text.starts_with('"') {
            let end = closing_quote(text)?;
            (Some(unescape(&text[1..end])), text[end + 1..].trim_start())
        } else if let Some(lt) = text.find('<') {
            let name = text[..lt].trim();
            ((!name.is_empty()).then(|| name.to_string()), &text[lt..])
        } else {
            (None, text)
        };

        if let Some(inner) = rest.strip_prefix('<') {
            let gt = inner.find('>')?;
            let uri = Uri::parse(&inner[..gt])?;
            let after = inner[gt + 1..].trim();
            let params = match after {
                "" => Params::new(),
                _ => Params::parse(after.strip_prefix(';')?)?,
            };
            return Some(Self::new(uri).with_display_name(display_name).with_params(params));
        }

        if display_name.is_some() {
            return None;
        }
        // addr-spec form: parameters after the URI belong to the header.
        let (uri, params) = match rest.split_once(';') {
            Some((uri, params)) => (Uri::parse(uri)?, Params::parse(params)?),
            None => (Uri::parse(rest)?, Params::new()),
        };
        Some(Self::new(uri).with_params(params))
    }

    fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
            write!(f, "\"{}\" ", escaped)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    /// `SIP/2.0`
    pub protocol: String,
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch").filter(|b| !b.is_empty())
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.splitn(3, '/');
        let name = parts.next()?.trim();
        let version = parts.next()?.trim();
        let rest = parts.next()?.trim_start();
        let version_ok = !version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.');
        if !name.eq_ignore_ascii_case("SIP") || !version_ok {
            return None;
        }
        let split = rest.find(char::is_whitespace)?;
        let transport = &rest[..split];
        if !is_token(transport) {
            return None;
        }
        let sent_by = rest[split..].trim_start();
        let (hostport, params) = match sent_by.split_once(';') {
            Some((hostport, params)) => (hostport.trim(), Params::parse(params)?),
            None => (sent_by.trim(), Params::new()),
        };
        let (host, port) = parse_hostport(hostport)?;
        Some(Self {
            protocol: format!("SIP/{}", version),
            transport: transport.to_ascii_uppercase(),
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.protocol, self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let seq = parse_number(parts.next()?)?;
        let method = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A `Digest` challenge from WWW-Authenticate or Proxy-Authenticate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    pub realm: Option<String>,
    pub domain: Option<String>,
    pub nonce: Option<String>,
    pub opaque: Option<String>,
    pub stale: bool,
    /// Upper-cased.
    pub algorithm: Option<String>,
    /// Lower-cased qop options in the order offered.
    pub qop: Vec<String>,
}

impl Challenge {
    fn parse(text: &str) -> Option<Self> {
        let (scheme, rest) = text.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return None;
        }
        let mut challenge = Challenge::default();
        for item in split_outside(rest, ',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (name, value) = item.split_once('=')?;
            let value = value.trim();
            let value = unquote(value).unwrap_or_else(|| value.to_string());
            match name.trim().to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = Some(value),
                "domain" => challenge.domain = Some(value),
                "nonce" => challenge.nonce = Some(value),
                "opaque" => challenge.opaque = Some(value),
                "stale" => challenge.stale = value.eq_ignore_ascii_case("true"),
                "algorithm" => challenge.algorithm = Some(value.to_ascii_uppercase()),
                "qop" => {
                    challenge.qop = value
                        .split(',')
                        .map(|q| q.trim().to_ascii_lowercase())
                        .filter(|q| !q.is_empty())
                        .collect()
                }
                _ => {}
            }
        }
        Some(challenge)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Lower-cased `type/subtype`.
    pub media_type: String,
    pub params: Params,
}

impl ContentType {
    fn parse(text: &str) -> Option<Self> {
        let (media, params) = match text.split_once(';') {
            Some((media, params)) => (media.trim(), Params::parse(params)?),
            None => (text, Params::new()),
        };
        let (kind, subtype) = media.split_once('/')?;
        if !is_token(kind.trim()) || !is_token(subtype.trim()) {
            return None;
        }
        Some(Self {
            media_type: format!("{}/{}", kind.trim(), subtype.trim()).to_ascii_lowercase(),
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpires {
    pub expires: u32,
    pub refresher: Option<String>,
}

impl SessionExpires {
    fn parse(text: &str) -> Option<Self> {
        let (value, params) = match text.split_once(';') {
            Some((value, params)) => (value.trim(), Params::parse(params)?),
            None => (text, Params::new()),
        };
        Some(Self {
            expires: parse_number(value)?,
            refresher: params.get("refresher").map(str::to_ascii_lowercase),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub event: String,
    pub params: Params,
}

impl EventHeader {
    pub fn id(&self) -> Option<&str> {
        self.params.get("id")
    }

    fn parse(text: &str) -> Option<Self> {
        let (event, params) = match text.split_once(';') {
            Some((event, params)) => (event.trim(), Params::parse(params)?),
            None => (text, Params::new()),
        };
        is_token(event).then(|| Self {
            event: event.to_ascii_lowercase(),
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaces {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
    pub early_only: bool,
}

impl Replaces {
    fn parse(text: &str) -> Option<Self> {
        let (call_id, params) = text.split_once(';')?;
        let call_id = call_id.trim();
        if call_id.is_empty() || call_id.contains(char::is_whitespace) {
            return None;
        }
        let params = Params::parse(params)?;
        Some(Self {
            call_id: call_id.to_string(),
            to_tag: params.get("to-tag")?.to_string(),
            from_tag: params.get("from-tag")?.to_string(),
            early_only: params.has("early-only"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstLine {
    Request { method: Method, uri: Uri },
    Response { status_code: u16, reason_phrase: String },
}

fn parse_first_line(text: &str) -> Option<FirstLine> {
    if let Some(rest) = text.strip_prefix("SIP/2.0 ") {
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        if code.len() != 3 {
            return None;
        }
        let status_code = u16::try_from(parse_number(code)?).ok()?;
        if !(100..=699).contains(&status_code) {
            return None;
        }
        return Some(FirstLine::Response {
            status_code,
            reason_phrase: reason.to_string(),
        });
    }
    let mut parts = text.splitn(3, ' ');
    let method = parts.next()?.parse().ok()?;
    let uri = Uri::parse(parts.next()?)?;
    if !parts.next()?.eq_ignore_ascii_case("SIP/2.0") {
        return None;
    }
    Some(FirstLine::Request { method, uri })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_uri_parts() {
        let uri: Uri = "sip:Alice@Example.COM:5070;transport=tcp;lr?subject=hi".parse().unwrap();
        assert_eq!(uri.scheme, "sip");
        assert_eq!(uri.user.as_deref(), Some("Alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.param("transport"), Some("tcp"));
        assert!(uri.params.has("lr"));
        assert_eq!(uri.to_string(), "sip:Alice@example.com:5070;transport=tcp;lr?subject=hi");

        let v6: Uri = "sips:[2001:DB8::1]:5061".parse().unwrap();
        assert_eq!(v6.host, "[2001:db8::1]");
        assert_eq!(v6.port, Some(5061));

        assert!(Uri::parse("not a uri").is_none());
        assert!(Uri::parse("sip:@host").is_none());
        assert!(Uri::parse("sip:alice@").is_none());
    }

    #[test]
    fn parses_name_addr_forms() {
        let quoted = NameAddr::parse("\"Bob \\\"B\\\" Smith\" <sip:bob@biloxi.com>;tag=a6c85cf").unwrap();
        assert_eq!(quoted.display_name.as_deref(), Some("Bob \"B\" Smith"));
        assert_eq!(quoted.tag(), Some("a6c85cf"));

        let token = NameAddr::parse("Alice <sip:alice@atlanta.com>").unwrap();
        assert_eq!(token.display_name.as_deref(), Some("Alice"));
        assert!(token.params.is_empty());

        let bare = NameAddr::parse("sip:carol@chicago.com;tag=1928").unwrap();
        assert_eq!(bare.uri.to_string(), "sip:carol@chicago.com");
        assert_eq!(bare.tag(), Some("1928"));

        assert_eq!(
            quoted.to_string(),
            "\"Bob \\\"B\\\" Smith\" <sip:bob@biloxi.com>;tag=a6c85cf"
        );
        assert!(NameAddr::parse("\"unterminated <sip:a@b>").is_none());
        assert!(NameAddr::parse("<sip:a@b").is_none());
    }

    #[test]
    fn parses_via() {
        let via = Via::parse("SIP / 2.0 / udp pc33.atlanta.com:5060 ;branch=z9hG4bK776asdhds ;received=192.0.2.1").unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.host, "pc33.atlanta.com");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(via.params.get("received"), Some("192.0.2.1"));
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP pc33.atlanta.com:5060;branch=z9hG4bK776asdhds;received=192.0.2.1"
        );
        assert!(Via::parse("SIP/2.0/UDP").is_none());
    }

    #[test]
    fn parses_cseq_and_numbers() {
        let cseq = CSeq::parse("314159 INVITE").unwrap();
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert!(CSeq::parse("abc INVITE").is_none());
        assert!(CSeq::parse("1 INVITE extra").is_none());
        assert_eq!(parse("70", Rule::Number), Some(Parsed::Number(70)));
        assert_eq!(parse("-1", Rule::Number), None);
    }

    #[test]
    fn parses_digest_challenge() {
        let parsed = parse(
            r#"Digest realm="atlanta.com", domain="sip:ss1.carrier.com", qop="auth,auth-int", nonce="f84f1cec41e6cbe5aea9c8e88d359", opaque="", stale=TRUE, algorithm=md5"#,
            Rule::Challenge,
        )
        .unwrap();
        let challenge = parsed.as_challenge().unwrap();
        assert_eq!(challenge.realm.as_deref(), Some("atlanta.com"));
        assert_eq!(challenge.nonce.as_deref(), Some("f84f1cec41e6cbe5aea9c8e88d359"));
        assert_eq!(challenge.opaque.as_deref(), Some(""));
        assert_eq!(challenge.qop, vec!["auth", "auth-int"]);
        assert!(challenge.stale);
        assert_eq!(challenge.algorithm.as_deref(), Some("MD5"));

        assert!(parse("Basic realm=\"x\"", Rule::Challenge).is_none());
    }

    #[test]
    fn splits_lists_outside_quotes_and_brackets() {
        let items = split_header_list("\"Doe, John\" <sip:j@a.com>;q=0.5, <sip:x@b.com;a=1,2>,sip:y@c.com");
        assert_eq!(
            items,
            vec!["\"Doe, John\" <sip:j@a.com>;q=0.5", "<sip:x@b.com;a=1,2>", "sip:y@c.com"]
        );
    }

    #[test]
    fn parses_first_lines() {
        match parse("INVITE sip:bob@biloxi.com SIP/2.0", Rule::FirstLine) {
            Some(Parsed::FirstLine(FirstLine::Request { method, uri })) => {
                assert_eq!(method, Method::Invite);
                assert_eq!(uri.host, "biloxi.com");
            }
            other => panic!("unexpected {:?}", other),
        }
        match parse("SIP/2.0 486 Busy Here", Rule::FirstLine) {
            Some(Parsed::FirstLine(FirstLine::Response { status_code, reason_phrase })) => {
                assert_eq!(status_code, 486);
                assert_eq!(reason_phrase, "Busy Here");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse("SIP/2.0 99 Nope", Rule::FirstLine).is_none());
        assert!(parse("INVITE sip:bob@biloxi.com HTTP/1.1", Rule::FirstLine).is_none());
    }

    #[test]
    fn parses_misc_headers() {
        let replaces = parse("425928@bobster.example.org;to-tag=7743;from-tag=6472;early-only", Rule::Replaces).unwrap();
        let replaces = replaces.as_replaces().unwrap();
        assert_eq!(replaces.to_tag, "7743");
        assert!(replaces.early_only);
        assert!(parse("abc;to-tag=1", Rule::Replaces).is_none());

        let se = parse("1800;refresher=UAC", Rule::SessionExpires).unwrap();
        assert_eq!(se.as_session_expires().unwrap().refresher.as_deref(), Some("uac"));

        let ct = parse("Application/SDP; charset=utf-8", Rule::ContentType).unwrap();
        assert_eq!(ct.as_content_type().unwrap().media_type, "application/sdp");

        let event = parse("refer;id=93809824", Rule::Event).unwrap();
        assert_eq!(event.as_event().unwrap().id(), Some("93809824"));

        assert_eq!(parse("*", Rule::Contact), Some(Parsed::Token("*".into())));
        assert_eq!(rule_for("Record-Route"), Some(Rule::NameAddr));
        assert_eq!(rule_for("X-Custom"), None);
    }
}

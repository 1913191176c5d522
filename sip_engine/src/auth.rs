//! HTTP Digest (RFC 2617) client side, MD5 only.

use core::fmt::Write;

use md5::Digest;

use crate::grammar::Challenge;
use crate::{utils, Result, SipError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    /// Realm the stored `ha1` was computed for.
    pub realm: Option<String>,
    /// Precomputed `MD5(username:realm:password)`.
    pub ha1: Option<String>,
}

impl Credentials {
    pub fn can_authenticate(&self) -> bool {
        self.password.is_some() || self.ha1.is_some()
    }
}

/// The parts of a request that enter the digest.
#[derive(Debug, Clone, Copy)]
pub struct DigestRequest<'a> {
    pub method: &'a str,
    pub ruri: &'a str,
    pub body: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// Digest state for one request sender. The nonce count persists across
/// challenges answered through the same instance.
#[derive(Debug, Clone)]
pub struct DigestAuthentication {
    credentials: Credentials,
    cnonce: Option<String>,
    nc: u32,
    nc_hex: heapless::String<8>,
    algorithm: Option<String>,
    realm: Option<String>,
    nonce: Option<String>,
    opaque: Option<String>,
    stale: bool,
    qop: Option<Qop>,
    method: Option<String>,
    uri: Option<String>,
    ha1: Option<String>,
    response: Option<String>,
}

impl DigestAuthentication {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            cnonce: None,
            nc: 0,
            nc_hex: heapless::String::new(),
            algorithm: None,
            realm: None,
            nonce: None,
            opaque: None,
            stale: false,
            qop: None,
            method: None,
            uri: None,
            ha1: None,
            response: None,
        }
    }

    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    pub fn ha1(&self) -> Option<&str> {
        self.ha1.as_deref()
    }

    pub fn nc(&self) -> u32 {
        self.nc
    }

    pub fn nc_hex(&self) -> &str {
        &self.nc_hex
    }

    pub fn stale(&self) -> bool {
        self.stale
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// Answers `challenge` for `request` with a random cnonce.
    pub fn authenticate(&mut self, request: DigestRequest<'_>, challenge: &Challenge) -> bool {
        self.authenticate_with_cnonce(request, challenge, None)
    }

    /// Returns false when the challenge cannot be answered: non-MD5
    /// algorithm, missing nonce or realm, an unusable qop list, or no
    /// password and no HA1 for the challenged realm.
    pub fn authenticate_with_cnonce(
        &mut self,
        request: DigestRequest<'_>,
        challenge: &Challenge,
        cnonce: Option<&str>,
    ) -> bool {
        if let Some(algorithm) = &challenge.algorithm {
            if algorithm != "MD5" {
                log::warn!("authenticate() | challenge with Digest algorithm different than \"MD5\", authentication aborted");
                return false;
            }
        }
        let (Some(realm), Some(nonce)) = (&challenge.realm, &challenge.nonce) else {
            log::warn!("authenticate() | challenge without Digest realm or nonce, authentication aborted");
            return false;
        };
        if self.credentials.password.is_none() {
            let usable_ha1 = self.credentials.ha1.is_some()
                && self.credentials.realm.as_deref() == Some(realm.as_str());
            if !usable_ha1 {
                log::warn!("authenticate() | no plain SIP password nor ha1 for the challenged realm, authentication aborted");
                return false;
            }
        }

        let qop = if challenge.qop.is_empty() {
            None
        } else if challenge.qop.iter().any(|q| q == "auth") {
            Some(Qop::Auth)
        } else if challenge.qop.iter().any(|q| q == "auth-int") {
            Some(Qop::AuthInt)
        } else {
            log::warn!("authenticate() | challenge without Digest qop different than \"auth\" or \"auth-int\", authentication aborted");
            return false;
        };

        self.algorithm = challenge.algorithm.clone();
        self.realm = Some(realm.clone());
        self.nonce = Some(nonce.clone());
        self.opaque = challenge.opaque.clone();
        self.stale = challenge.stale;
        self.qop = qop;
        self.method = Some(request.method.to_string());
        self.uri = Some(request.ruri.to_string());
        self.cnonce = Some(cnonce.map_or_else(|| utils::random_token(12), str::to_string));

        self.nc = self.nc.checked_add(1).unwrap_or(1);
        self.nc_hex.clear();
        let _ = write!(self.nc_hex, "{:08x}", self.nc);

        let ha1 = match &self.credentials.password {
            Some(password) => md5_hex(format!("{}:{}:{}", self.credentials.username, realm, password).as_bytes()),
            None => self.credentials.ha1.clone().unwrap_or_default(),
        };
        self.credentials.realm = Some(realm.clone());
        self.credentials.ha1 = Some(ha1.clone());

        let cnonce = self.cnonce.as_deref().unwrap_or_default();
        let response = match qop {
            Some(Qop::Auth) => {
                let ha2 = md5_hex(format!("{}:{}", request.method, request.ruri).as_bytes());
                md5_hex(format!("{}:{}:{}:{}:auth:{}", ha1, nonce, self.nc_hex, cnonce, ha2).as_bytes())
            }
            Some(Qop::AuthInt) => {
                let body_hash = md5_hex(request.body.unwrap_or("").as_bytes());
                let ha2 = md5_hex(format!("{}:{}:{}", request.method, request.ruri, body_hash).as_bytes());
                md5_hex(format!("{}:{}:{}:{}:auth-int:{}", ha1, nonce, self.nc_hex, cnonce, ha2).as_bytes())
            }
            None => {
                let ha2 = md5_hex(format!("{}:{}", request.method, request.ruri).as_bytes());
                md5_hex(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes())
            }
        };

        self.ha1 = Some(ha1);
        self.response = Some(response);
        true
    }

    /// Value for the Authorization or Proxy-Authorization header.
    pub fn header_value(&self) -> Result<String> {
        let response = self
            .response
            .as_deref()
            .ok_or(SipError::Auth("response field does not exist, cannot generate Authorization header"))?;

        let mut out = String::from("Digest algorithm=MD5");
        let _ = write!(
            out,
            ", username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.credentials.username,
            self.realm.as_deref().unwrap_or_default(),
            self.nonce.as_deref().unwrap_or_default(),
            self.uri.as_deref().unwrap_or_default(),
            response
        );
        if let Some(opaque) = &self.opaque {
            let _ = write!(out, ", opaque=\"{}\"", opaque);
        }
        if let Some(qop) = self.qop {
            let _ = write!(
                out,
                ", qop={}, cnonce=\"{}\", nc={}",
                qop.as_str(),
                self.cnonce.as_deref().unwrap_or_default(),
                self.nc_hex
            );
        }
        Ok(out)
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    let digest = md5::Md5::digest(data);
    let mut out = String::new();
    for b in &digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Credentials {
        Credentials {
            username: "alice".into(),
            password: Some("secret".into()),
            ..Credentials::default()
        }
    }

    fn challenge(qop: &[&str]) -> Challenge {
        Challenge {
            realm: Some("example.com".into()),
            nonce: Some("abc123".into()),
            qop: qop.iter().map(|q| q.to_string()).collect(),
            ..Challenge::default()
        }
    }

    const REGISTER: DigestRequest<'static> = DigestRequest {
        method: "REGISTER",
        ruri: "sip:example.com",
        body: None,
    };

    #[test]
    fn qop_auth_response_matches_manual_digest() {
        let mut auth = DigestAuthentication::new(alice());
        assert!(auth.authenticate_with_cnonce(REGISTER, &challenge(&["auth"]), Some("0a4f113b")));

        let ha1 = md5_hex(b"alice:example.com:secret");
        let ha2 = md5_hex(b"REGISTER:sip:example.com");
        let expected = md5_hex(format!("{}:abc123:00000001:0a4f113b:auth:{}", ha1, ha2).as_bytes());
        assert_eq!(auth.response(), Some(expected.as_str()));
        assert_eq!(auth.ha1(), Some(ha1.as_str()));
        assert_eq!(auth.realm(), Some("example.com"));
        assert_eq!(
            auth.header_value().unwrap(),
            format!(
                "Digest algorithm=MD5, username=\"alice\", realm=\"example.com\", nonce=\"abc123\", uri=\"sip:example.com\", response=\"{}\", qop=auth, cnonce=\"0a4f113b\", nc=00000001",
                expected
            )
        );
    }

    #[test]
    fn prefers_auth_over_auth_int() {
        let mut auth = DigestAuthentication::new(alice());
        assert!(auth.authenticate(REGISTER, &challenge(&["auth-int", "auth"])));
        assert!(auth.header_value().unwrap().contains("qop=auth,"));

        let mut auth = DigestAuthentication::new(alice());
        let request = DigestRequest {
            body: Some("v=0"),
            ..REGISTER
        };
        assert!(auth.authenticate_with_cnonce(request, &challenge(&["auth-int"]), Some("c")));
        let ha1 = md5_hex(b"alice:example.com:secret");
        let ha2 = md5_hex(format!("REGISTER:sip:example.com:{}", md5_hex(b"v=0")).as_bytes());
        let expected = md5_hex(format!("{}:abc123:00000001:c:auth-int:{}", ha1, ha2).as_bytes());
        assert_eq!(auth.response(), Some(expected.as_str()));

        let mut auth = DigestAuthentication::new(alice());
        assert!(!auth.authenticate(REGISTER, &challenge(&["auth-conf"])));
    }

    #[test]
    fn rejects_unanswerable_challenges() {
        let mut auth = DigestAuthentication::new(alice());
        let mut sha = challenge(&[]);
        sha.algorithm = Some("SHA-256".into());
        assert!(!auth.authenticate(REGISTER, &sha));

        let mut no_nonce = challenge(&[]);
        no_nonce.nonce = None;
        assert!(!auth.authenticate(REGISTER, &no_nonce));

        let ha1_only = Credentials {
            username: "alice".into(),
            realm: Some("other.com".into()),
            ha1: Some("deadbeef".into()),
            ..Credentials::default()
        };
        let mut auth = DigestAuthentication::new(ha1_only.clone());
        assert!(!auth.authenticate(REGISTER, &challenge(&[])));

        let mut matching = ha1_only;
        matching.realm = Some("example.com".into());
        let mut auth = DigestAuthentication::new(matching);
        assert!(auth.authenticate(REGISTER, &challenge(&[])));
        assert_eq!(auth.ha1(), Some("deadbeef"));

        let fresh = DigestAuthentication::new(alice());
        assert!(fresh.header_value().is_err());
    }

    #[test]
    fn nonce_count_wraps_to_one() {
        let mut auth = DigestAuthentication::new(alice());
        auth.nc = 0xffff_fffe;
        assert!(auth.authenticate(REGISTER, &challenge(&["auth"])));
        assert_eq!(auth.nc_hex(), "ffffffff");
        assert!(auth.authenticate(REGISTER, &challenge(&["auth"])));
        assert_eq!(auth.nc(), 1);
        assert_eq!(auth.nc_hex(), "00000001");
    }

    #[test]
    fn rfc2617_reference_vector() {
        let creds = Credentials {
            username: "Mufasa".into(),
            password: Some("Circle Of Life".into()),
            ..Credentials::default()
        };
        let challenge = Challenge {
            realm: Some("testrealm@host.com".into()),
            nonce: Some("dcd98b7102dd2f0e8b11d0f600bfb0c093".into()),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
            qop: vec!["auth".into(), "auth-int".into()],
            ..Challenge::default()
        };
        let request = DigestRequest {
            method: "GET",
            ruri: "/dir/index.html",
            body: None,
        };
        let mut auth = DigestAuthentication::new(creds);
        assert!(auth.authenticate_with_cnonce(request, &challenge, Some("0a4f113b")));
        assert_eq!(auth.response(), Some("6629fae49393a05397450978507c4ef1"));
        assert!(auth
            .header_value()
            .unwrap()
            .contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
    }

    #[test]
    fn md5_round_trip_reference() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}

use crate::auth::Credentials;
use crate::constants::USER_AGENT;
use crate::grammar::Uri;
use crate::utils;

/// User agent settings consulted when building requests and responses.
///
/// `credentials.realm` and `credentials.ha1` are written back after a
/// successful challenge so later requests can authenticate without the
/// plaintext password.
#[derive(Debug, Clone)]
pub struct UaConfig {
    /// Address of record, used for From and To of out-of-dialog requests.
    pub uri: Uri,
    pub display_name: Option<String>,
    pub credentials: Credentials,
    /// Host placed in the Via sent-by of every request.
    pub via_host: String,
    /// Contact URI advertised in REGISTER and dialog-creating requests.
    pub contact: Uri,
    pub user_agent: String,
    /// Adds `Route: <outbound_proxy;lr>` to requests without a route set.
    pub use_preloaded_route: bool,
    pub outbound_proxy: Option<Uri>,
    /// Advertise the `timer` option tag (RFC 4028).
    pub session_timers: bool,
    /// Registrar; defaults to the host part of `uri`.
    pub registrar_server: Option<Uri>,
    pub register_expires: u32,
    /// Prefix of generated Call-IDs.
    pub call_id_prefix: String,
}

impl UaConfig {
    pub fn new(uri: Uri) -> Self {
        let via_host = format!("{}.invalid", utils::random_token(12));
        let contact = Uri::new(
            "sip",
            Some(utils::random_token(8)),
            via_host.clone(),
            None,
        );
        let credentials = Credentials {
            username: uri.user.clone().unwrap_or_default(),
            ..Credentials::default()
        };
        Self {
            uri,
            display_name: None,
            credentials,
            via_host,
            contact,
            user_agent: USER_AGENT.to_string(),
            use_preloaded_route: false,
            outbound_proxy: None,
            session_timers: true,
            registrar_server: None,
            register_expires: 600,
            call_id_prefix: utils::random_token(5),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.credentials.password = Some(password.into());
        self
    }

    pub fn registrar(&self) -> Uri {
        self.registrar_server
            .clone()
            .unwrap_or_else(|| Uri::new("sip", None, self.uri.host.clone(), self.uri.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_address_of_record() {
        let config = UaConfig::new("sip:alice@example.com:5070".parse().unwrap()).with_password("secret");
        assert_eq!(config.credentials.username, "alice");
        assert_eq!(config.credentials.password.as_deref(), Some("secret"));
        assert!(config.via_host.ends_with(".invalid"));
        assert_eq!(config.registrar().to_string(), "sip:example.com:5070");
        assert_eq!(config.register_expires, 600);
    }
}

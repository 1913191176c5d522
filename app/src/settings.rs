//! Compile-time configuration loaded via `toml-cfg`.

use std::net::{SocketAddr, ToSocketAddrs};

use sip_engine::{UaConfig, Uri};

use crate::AppError;

#[toml_cfg::toml_config]
pub struct Settings {
    #[default("sip:user@example.com")]
    pub sip_uri: &'static str,
    #[default("")]
    pub sip_password: &'static str,
    #[default("")]
    pub sip_display_name: &'static str,
    // Next hop for every datagram: outbound proxy or registrar.
    #[default("sip:example.com")]
    pub sip_proxy: &'static str,
    #[default("0.0.0.0:5060")]
    pub sip_bind: &'static str,
    #[default("600")]
    pub register_expires: &'static str,
    #[default("false")]
    pub auto_answer: &'static str,
}

impl Settings {
    pub fn auto_answer(&self) -> bool {
        self.auto_answer.eq_ignore_ascii_case("true")
    }

    /// Resolves `sip_proxy` to a socket address, 5060 if no port is given.
    pub fn proxy_addr(&self) -> Result<SocketAddr, AppError> {
        let host_port = host_port(self.sip_proxy);
        host_port
            .to_socket_addrs()
            .map_err(|err| AppError::Config(format!("cannot resolve {host_port}: {err}")))?
            .next()
            .ok_or_else(|| AppError::Config(format!("no address for {host_port}")))
    }

    /// User agent configuration for a socket bound at `local`.
    pub fn ua_config(&self, local: SocketAddr) -> Result<UaConfig, AppError> {
        let uri: Uri = self
            .sip_uri
            .parse()
            .map_err(|err| AppError::Config(format!("sip_uri: {err}")))?;
        let proxy: Uri = self
            .sip_proxy
            .parse()
            .map_err(|err| AppError::Config(format!("sip_proxy: {err}")))?;
        let expires = self
            .register_expires
            .parse()
            .map_err(|err| AppError::Config(format!("register_expires: {err}")))?;

        let host = local.ip().to_string();
        let mut config = UaConfig::new(uri.clone());
        if !self.sip_password.is_empty() {
            config = config.with_password(self.sip_password);
        }
        if !self.sip_display_name.is_empty() {
            config.display_name = Some(self.sip_display_name.to_string());
        }
        config.contact = Uri::new("sip", uri.user.clone(), host.clone(), Some(local.port()));
        config.via_host = host;
        config.register_expires = expires;
        config.use_preloaded_route = proxy.host != uri.host;
        config.outbound_proxy = Some(proxy);
        Ok(config)
    }
}

fn host_port(uri: &str) -> String {
    let mut host = uri
        .trim_start_matches("sips:")
        .trim_start_matches("sip:")
        .split(';')
        .next()
        .unwrap_or(uri)
        .to_string();
    if !host.contains(':') {
        host.push_str(":5060");
    }
    host
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            sip_uri: "sip:alice@example.com",
            sip_password: "secret",
            sip_display_name: "Alice",
            sip_proxy: "sip:192.0.2.10:5070;transport=udp",
            sip_bind: "0.0.0.0:5060",
            register_expires: "300",
            auto_answer: "TRUE",
        }
    }

    #[test]
    fn proxy_host_port_defaults_to_5060() {
        assert_eq!(host_port("sip:example.com"), "example.com:5060");
        assert_eq!(host_port("sip:192.0.2.10:5070;transport=udp"), "192.0.2.10:5070");
        assert_eq!(settings().proxy_addr().unwrap(), "192.0.2.10:5070".parse().unwrap());
    }

    #[test]
    fn ua_config_uses_local_address() {
        let local: SocketAddr = "192.0.2.1:5062".parse().unwrap();
        let config = settings().ua_config(local).unwrap();
        assert_eq!(config.via_host, "192.0.2.1");
        assert_eq!(config.contact.to_string(), "sip:alice@192.0.2.1:5062");
        assert_eq!(config.credentials.password.as_deref(), Some("secret"));
        assert_eq!(config.register_expires, 300);
        assert!(config.use_preloaded_route);
        assert!(settings().auto_answer());
    }
}

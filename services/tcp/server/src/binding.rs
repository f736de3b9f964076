//! Listening point configuration.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tcp_session::{InboundOptions, TlsCertificate};

/// Whether connections on a binding start with a TLS handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plaintext; TLS may still be negotiated later when a certificate is set
    #[default]
    None,
    /// TLS handshake before the protocol starts
    Required,
}

/// One configured listening target.
///
/// A binding in [`TlsMode::Required`] always carries a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    ip: IpAddr,
    port: u16,
    tls_mode: TlsMode,
    certificate: Option<TlsCertificate>,
    host_name: String,
}

impl Binding {
    /// Plaintext binding
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            tls_mode: TlsMode::None,
            certificate: None,
            host_name: String::new(),
        }
    }

    /// Plaintext binding on every IPv4 address
    pub fn any(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// Require TLS from the first byte, presenting `certificate`
    pub fn with_tls(mut self, certificate: TlsCertificate) -> Self {
        self.tls_mode = TlsMode::Required;
        self.certificate = Some(certificate);
        self
    }

    /// Certificate for on-demand TLS (STARTTLS-style) on a plaintext binding
    pub fn with_certificate(mut self, certificate: TlsCertificate) -> Self {
        self.certificate = Some(certificate);
        self
    }

    /// Host name announced by sessions accepted on this binding
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    /// Address to listen on
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Port to listen on; 0 picks a free port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Requested socket address
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// TLS mode
    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    /// Server certificate, if any
    pub fn certificate(&self) -> Option<&TlsCertificate> {
        self.certificate.as_ref()
    }

    /// Host name
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub(crate) fn inbound_options(&self) -> InboundOptions {
        InboundOptions {
            host_name: self.host_name.clone(),
            require_tls: self.tls_mode == TlsMode::Required,
            certificate: self.certificate.clone(),
            ..InboundOptions::default()
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())?;
        if self.tls_mode == TlsMode::Required {
            f.write_str(" (tls)")?;
        }
        if !self.host_name.is_empty() {
            write!(f, " [{}]", self.host_name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_binding_equality() {
        let a = Binding::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 25).with_host_name("mx");
        let b = Binding::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 25).with_host_name("mx");
        assert_eq!(a, b);
        assert_ne!(a, b.clone().with_host_name("other"));
        assert_ne!(a, Binding::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 25).with_host_name("mx"));
    }

    #[test]
    fn test_inbound_options() {
        let plain = Binding::any(2525).with_host_name("mail.test");
        let options = plain.inbound_options();
        assert!(!options.require_tls);
        assert!(options.certificate.is_none());
        assert_eq!(options.host_name, "mail.test");
        assert_eq!(plain.to_string(), "0.0.0.0:2525 [mail.test]");
    }
}

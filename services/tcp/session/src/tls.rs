//! TLS configuration for session upgrades.
//!
//! Server sessions present a [`TlsCertificate`]. Client sessions validate the
//! server through a [`CertificateValidator`] that sees which policy checks
//! failed ([`CertificatePolicyErrors`]) and may optionally offer a client
//! certificate chosen by a [`ClientCertificateSelector`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::sign::CertifiedKey;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

static PROVIDER: Lazy<Arc<CryptoProvider>> =
    Lazy::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Mozilla root certificates, embedded at compile time
static WEBPKI_ROOTS: Lazy<Arc<RootCertStore>> = Lazy::new(|| {
    Arc::new(RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    })
});

/// Crypto provider used for every config built by this crate
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::clone(&PROVIDER)
}

/// Certificate chain plus private key
#[derive(Clone)]
pub struct TlsCertificate {
    chain: Vec<CertificateDer<'static>>,
    key: Arc<PrivateKeyDer<'static>>,
}

impl TlsCertificate {
    /// Build from DER parts. The chain must not be empty.
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        if chain.is_empty() {
            return Err(SessionError::InvalidArgument(
                "certificate chain is empty".into(),
            ));
        }
        Ok(Self {
            chain,
            key: Arc::new(key),
        })
    }

    /// Parse a PEM certificate chain and a PEM private key (PKCS#8, PKCS#1 or SEC1)
    pub fn from_pem(cert_chain_pem: &str, private_key_pem: &str) -> Result<Self> {
        let chain = rustls_pemfile::certs(&mut cert_chain_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SessionError::Tls(format!("failed to parse certificate chain: {}", e)))?;
        if chain.is_empty() {
            return Err(SessionError::Tls("no certificates found in certificate chain".into()));
        }

        let key = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .map_err(|e| SessionError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| SessionError::Tls("no private key found".into()))?;

        Self::new(chain, key)
    }

    /// Load a PEM certificate chain file and a PEM private key file
    pub fn from_pem_files(
        cert_chain_path: impl AsRef<Path>,
        private_key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let chain = std::fs::read_to_string(cert_chain_path.as_ref())?;
        let key = std::fs::read_to_string(private_key_path.as_ref())?;
        Self::from_pem(&chain, &key)
    }

    /// Certificate chain, leaf first
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Leaf certificate
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let signing_key = PROVIDER.key_provider.load_private_key(self.key.clone_key())?;
        Ok(Arc::new(CertifiedKey::new(self.chain.clone(), signing_key)))
    }
}

impl PartialEq for TlsCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain && self.key.secret_der() == other.key.secret_der()
    }
}

impl Eq for TlsCertificate {}

impl fmt::Debug for TlsCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCertificate")
            .field("chain_len", &self.chain.len())
            .field("leaf_len", &self.leaf().len())
            .finish_non_exhaustive()
    }
}

/// Create a TLS acceptor presenting `certificate`
pub fn server_tls_acceptor(certificate: &TlsCertificate) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certificate.chain.clone(), certificate.key.clone_key())?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

bitflags! {
    /// Checks that failed while validating a server certificate
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CertificatePolicyErrors: u8 {
        /// Certificate is not valid for the requested server name
        const NAME_MISMATCH = 0b01;
        /// Chain does not lead to a trusted root, or is otherwise invalid
        const CHAIN_ERRORS = 0b10;
    }
}

/// Input to a [`CertificateValidator`]
#[derive(Debug)]
pub struct CertificateCheck<'a> {
    /// Name the client asked for
    pub server_name: &'a str,
    /// Leaf certificate presented by the server
    pub end_entity: &'a CertificateDer<'a>,
    /// Failed checks; empty when the certificate is fully valid
    pub errors: CertificatePolicyErrors,
    /// The chain error, when [`CertificatePolicyErrors::CHAIN_ERRORS`] is set
    pub chain_error: Option<&'a rustls::Error>,
}

/// Decides whether a server certificate is trusted
pub trait CertificateValidator: Send + Sync {
    /// Return true to continue the handshake
    fn validate(&self, check: &CertificateCheck<'_>) -> bool;
}

impl<F> CertificateValidator for F
where
    F: Fn(&CertificateCheck<'_>) -> bool + Send + Sync,
{
    fn validate(&self, check: &CertificateCheck<'_>) -> bool {
        self(check)
    }
}

/// Accepts valid certificates, tolerates a bare name mismatch with a warning,
/// and rejects everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCertificateValidator;

impl CertificateValidator for DefaultCertificateValidator {
    fn validate(&self, check: &CertificateCheck<'_>) -> bool {
        if check.errors.is_empty() {
            return true;
        }
        if check.errors == CertificatePolicyErrors::NAME_MISMATCH {
            warn!(
                server_name = check.server_name,
                "server certificate name mismatch; accepting"
            );
            return true;
        }
        warn!(
            server_name = check.server_name,
            errors = ?check.errors,
            chain_error = ?check.chain_error,
            "server certificate rejected"
        );
        false
    }
}

/// Picks the client certificate to present, if any
pub trait ClientCertificateSelector: Send + Sync {
    /// `acceptable_issuers` are the DER subjects the server hinted at
    fn select(&self, acceptable_issuers: &[&[u8]]) -> Option<TlsCertificate>;
}

impl<F> ClientCertificateSelector for F
where
    F: Fn(&[&[u8]]) -> Option<TlsCertificate> + Send + Sync,
{
    fn select(&self, acceptable_issuers: &[&[u8]]) -> Option<TlsCertificate> {
        self(acceptable_issuers)
    }
}

/// Client-side TLS settings.
///
/// The default trusts the Mozilla root set; [`ClientTlsOptions::with_pem_roots`]
/// adds private anchors on top of it.
#[derive(Clone)]
pub struct ClientTlsOptions {
    /// Trust anchors for chain validation
    pub roots: Arc<RootCertStore>,
    /// Trust decision callback
    pub validator: Arc<dyn CertificateValidator>,
    /// Client certificate callback; none is offered when absent
    pub certificate_selector: Option<Arc<dyn ClientCertificateSelector>>,
}

impl Default for ClientTlsOptions {
    fn default() -> Self {
        Self {
            roots: Arc::clone(&WEBPKI_ROOTS),
            validator: Arc::new(DefaultCertificateValidator),
            certificate_selector: None,
        }
    }
}

impl ClientTlsOptions {
    /// Add every certificate in `pem` to the trust anchors
    pub fn with_pem_roots(mut self, pem: &str) -> Result<Self> {
        let mut roots = (*self.roots).clone();
        for cert in rustls_pemfile::certs(&mut pem.as_bytes()) {
            let cert = cert.map_err(|e| SessionError::Tls(format!("failed to parse root: {}", e)))?;
            roots.add(cert)?;
        }
        self.roots = Arc::new(roots);
        Ok(self)
    }
}

impl fmt::Debug for ClientTlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTlsOptions")
            .field("roots", &self.roots.len())
            .field("certificate_selector", &self.certificate_selector.is_some())
            .finish_non_exhaustive()
    }
}

/// Create a TLS connector that validates through `options`
pub fn client_tls_connector(options: &ClientTlsOptions) -> Result<TlsConnector> {
    let provider = crypto_provider();
    let verifier = PolicyVerifier {
        roots: Arc::clone(&options.roots),
        validator: Arc::clone(&options.validator),
        provider: Arc::clone(&provider),
    };

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));

    let config = match &options.certificate_selector {
        Some(selector) => builder.with_client_cert_resolver(Arc::new(SelectorResolver {
            selector: Arc::clone(selector),
        })),
        None => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parse `host` into a TLS server name (DNS name or IP literal)
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_owned())
        .map_err(|_| SessionError::InvalidArgument(format!("invalid server name: {}", host)))
}

/// Server certificate verifier that defers the trust decision to a validator
struct PolicyVerifier {
    roots: Arc<RootCertStore>,
    validator: Arc<dyn CertificateValidator>,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for PolicyVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyVerifier")
            .field("roots", &self.roots.len())
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let parsed = ParsedCertificate::try_from(end_entity)?;
        let mut errors = CertificatePolicyErrors::empty();

        let chain_error = rustls::client::verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )
        .err();
        if chain_error.is_some() {
            errors |= CertificatePolicyErrors::CHAIN_ERRORS;
        }

        let name_error = rustls::client::verify_server_name(&parsed, server_name).err();
        if name_error.is_some() {
            errors |= CertificatePolicyErrors::NAME_MISMATCH;
        }

        let name = display_name(server_name);
        let check = CertificateCheck {
            server_name: &name,
            end_entity,
            errors,
            chain_error: chain_error.as_ref(),
        };
        debug!(server_name = %name, errors = ?errors, "validating server certificate");

        if self.validator.validate(&check) {
            return Ok(ServerCertVerified::assertion());
        }
        Err(chain_error
            .or(name_error)
            .unwrap_or(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            )))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn display_name(name: &ServerName<'_>) -> String {
    match name {
        ServerName::DnsName(dns) => dns.as_ref().to_string(),
        ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
        other => format!("{:?}", other),
    }
}

/// Adapts a [`ClientCertificateSelector`] to rustls
struct SelectorResolver {
    selector: Arc<dyn ClientCertificateSelector>,
}

impl fmt::Debug for SelectorResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorResolver").finish_non_exhaustive()
    }
}

impl ResolvesClientCert for SelectorResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let certificate = self.selector.select(root_hint_subjects)?;
        match certificate.certified_key() {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("selected client certificate is unusable: {}", e);
                None
            }
        }
    }

    fn has_certs(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use rustls::pki_types::PrivatePkcs8KeyDer;

    /// Self-signed certificate for `name`, valid for that DNS name only
    pub(crate) fn self_signed(name: &str) -> TlsCertificate {
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let chain = vec![CertificateDer::from(cert.der().to_vec())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        TlsCertificate::new(chain, key).unwrap()
    }

    /// Client options trusting exactly `certificate`
    pub(crate) fn trusting(certificate: &TlsCertificate) -> ClientTlsOptions {
        let mut roots = RootCertStore::empty();
        roots.add(certificate.leaf().clone()).unwrap();
        ClientTlsOptions {
            roots: Arc::new(roots),
            ..ClientTlsOptions::default()
        }
    }

    fn dummy_cert() -> CertificateDer<'static> {
        CertificateDer::from(vec![0u8; 4])
    }

    #[test]
    fn test_default_validator_policy() {
        let cert = dummy_cert();
        let validator = DefaultCertificateValidator;
        let chain_err = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);

        let ok = CertificateCheck {
            server_name: "example.org",
            end_entity: &cert,
            errors: CertificatePolicyErrors::empty(),
            chain_error: None,
        };
        assert!(validator.validate(&ok));

        let mismatch = CertificateCheck {
            errors: CertificatePolicyErrors::NAME_MISMATCH,
            ..ok
        };
        assert!(validator.validate(&mismatch));

        let chain = CertificateCheck {
            server_name: "example.org",
            end_entity: &cert,
            errors: CertificatePolicyErrors::CHAIN_ERRORS,
            chain_error: Some(&chain_err),
        };
        assert!(!validator.validate(&chain));

        let both = CertificateCheck {
            server_name: "example.org",
            end_entity: &cert,
            errors: CertificatePolicyErrors::all(),
            chain_error: Some(&chain_err),
        };
        assert!(!validator.validate(&both));
    }

    #[test]
    fn test_certificate_from_pem() {
        let mut params = CertificateParams::new(vec!["pem.test".to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let parsed = TlsCertificate::from_pem(&cert.pem(), &key_pair.serialize_pem()).unwrap();
        assert_eq!(parsed.chain().len(), 1);
        assert_eq!(parsed.leaf().as_ref(), cert.der().as_ref());

        assert!(TlsCertificate::from_pem("", &key_pair.serialize_pem()).is_err());
        assert!(TlsCertificate::from_pem(&cert.pem(), "").is_err());
    }

    #[test]
    fn test_pem_roots() {
        let params = CertificateParams::new(vec!["ca.test".to_string()]).unwrap();
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        let public = ClientTlsOptions::default().roots.len();
        let options = ClientTlsOptions::default().with_pem_roots(&cert.pem()).unwrap();
        assert_eq!(options.roots.len(), public + 1);
        let options = options.with_pem_roots("").unwrap();
        assert_eq!(options.roots.len(), public + 1);
        assert_eq!(ClientTlsOptions::default().roots.len(), public);
    }

    #[test]
    fn test_default_roots_are_public_anchors() {
        let options = ClientTlsOptions::default();
        assert!(!options.roots.is_empty());
        assert_eq!(options.roots.len(), webpki_roots::TLS_SERVER_ROOTS.len());
    }

    #[test]
    fn test_certificate_equality() {
        let a = self_signed("a.test");
        let b = self_signed("a.test");
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_builders() {
        let cert = self_signed("localhost");
        assert!(server_tls_acceptor(&cert).is_ok());
        assert!(client_tls_connector(&trusting(&cert)).is_ok());
        assert!(client_tls_connector(&ClientTlsOptions::default()).is_ok());
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a name").is_err());
    }
}

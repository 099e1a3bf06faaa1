//! TLS configuration surface.
//!
//! A [`TlsConfig`] is plain data describing how to verify peers. It is
//! compiled once per client into a `rustls::ClientConfig` plus the pinning
//! and hostname rules that rustls cannot express on its own, and the
//! compiled context is injected into `Connection::connect`; there is no
//! process-global TLS state.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha1::Sha1;
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};

/// Days since the epoch for 2026-02-01.
///
/// When regular maintenance updates this value, set it to roughly six
/// months before the release date.
const RECENT_DATE_DAYS: u64 = 1_769_904_000 / 86_400;
const RECENT_DATE_LABEL: &str = "2026-02-01";

/// TLS settings for a client.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    verify: bool,
    ca_certs: Option<PathBuf>,
    ca_cert_dir: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    key_password: Option<String>,
    assert_hostname: AssertHostname,
    assert_fingerprint: Option<String>,
    server_hostname: Option<String>,
    min_version: Option<TlsVersion>,
}

/// Minimum accepted protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

#[derive(Clone, Debug, Default)]
enum AssertHostname {
    /// Verify against the connected host (or tunnel host).
    #[default]
    Default,
    /// Chain verification only; the certificate may name any host.
    Disabled,
    /// Verify against this name instead of the connected host.
    Override(String),
}

impl Default for TlsConfig {
    fn default() -> TlsConfig {
        TlsConfig {
            verify: true,
            ca_certs: None,
            ca_cert_dir: None,
            cert_file: None,
            key_file: None,
            key_password: None,
            assert_hostname: AssertHostname::Default,
            assert_fingerprint: None,
            server_hostname: None,
            min_version: None,
        }
    }
}

impl TlsConfig {
    pub fn new() -> TlsConfig {
        TlsConfig::default()
    }

    /// Disables certificate verification entirely.
    ///
    /// Emits an `InsecureRequestWarning`-style log line once per process
    /// when a connection is actually made this way.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> TlsConfig {
        self.verify = !accept;
        self
    }

    /// A PEM bundle of trusted roots, replacing the system store.
    pub fn ca_certs(mut self, path: impl AsRef<Path>) -> TlsConfig {
        self.ca_certs = Some(path.as_ref().to_owned());
        self
    }

    /// A directory of PEM roots, replacing the system store.
    pub fn ca_cert_dir(mut self, path: impl AsRef<Path>) -> TlsConfig {
        self.ca_cert_dir = Some(path.as_ref().to_owned());
        self
    }

    /// Client certificate chain (PEM) for mutual TLS.
    pub fn cert_file(mut self, path: impl AsRef<Path>) -> TlsConfig {
        self.cert_file = Some(path.as_ref().to_owned());
        self
    }

    /// Private key (PEM) matching [`TlsConfig::cert_file`].
    pub fn key_file(mut self, path: impl AsRef<Path>) -> TlsConfig {
        self.key_file = Some(path.as_ref().to_owned());
        self
    }

    /// Passphrase for an encrypted private key.
    ///
    /// Encrypted keys are not supported by the rustls PEM loader; setting
    /// this produces a clear error at build time rather than a silent
    /// misparse.
    pub fn key_password(mut self, password: impl Into<String>) -> TlsConfig {
        self.key_password = Some(password.into());
        self
    }

    /// Verifies the certificate against this hostname instead of the
    /// connected host.
    pub fn assert_hostname(mut self, hostname: impl Into<String>) -> TlsConfig {
        self.assert_hostname = AssertHostname::Override(hostname.into());
        self
    }

    /// Keeps chain verification but skips the hostname check.
    pub fn danger_disable_hostname_verification(mut self) -> TlsConfig {
        self.assert_hostname = AssertHostname::Disabled;
        self
    }

    /// Pins the peer certificate to a hex digest, `:`-delimited or not.
    ///
    /// The digest algorithm is selected by length: MD5, SHA-1, or
    /// SHA-256. Pinning replaces chain verification.
    pub fn assert_fingerprint(mut self, fingerprint: impl Into<String>) -> TlsConfig {
        self.assert_fingerprint = Some(fingerprint.into());
        self
    }

    /// Overrides the SNI name sent in the handshake.
    pub fn server_hostname(mut self, hostname: impl Into<String>) -> TlsConfig {
        self.server_hostname = Some(hostname.into());
        self
    }

    /// Refuses protocol versions below this one.
    pub fn min_tls_version(mut self, version: TlsVersion) -> TlsConfig {
        self.min_version = Some(version);
        self
    }

    /// Compiles the settings into a reusable context.
    pub(crate) fn build(&self) -> Result<TlsContext> {
        let fingerprint = self
            .assert_fingerprint
            .as_deref()
            .map(Fingerprint::parse)
            .transpose()?;

        static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

        let provider = Arc::new(ring::default_provider());
        let versions = match self.min_version {
            Some(TlsVersion::Tls13) => TLS13_ONLY,
            Some(TlsVersion::Tls12) | None => rustls::ALL_VERSIONS,
        };
        let builder = ClientConfig::builder_with_protocol_versions(versions);

        let builder = if fingerprint.is_some() || !self.verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAll(provider)))
        } else {
            let roots = Arc::new(self.load_roots()?);
            match self.assert_hostname {
                AssertHostname::Disabled => {
                    let verifier = WebPkiServerVerifier::builder(roots)
                        .build()
                        .map_err(Error::new_tls)?;
                    builder
                        .dangerous()
                        .with_custom_certificate_verifier(Arc::new(AnyHostname(verifier)))
                }
                _ => builder.with_root_certificates(roots),
            }
        };

        let mut config = match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                if self.key_password.is_some() {
                    return Err(Error::new_tls_msg(
                        "encrypted private keys are not supported",
                    ));
                }
                let certs = load_pem_certs(cert)?;
                let key = load_pem_key(key)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(Error::new_tls)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(Error::new_tls_msg(
                    "cert_file and key_file must be set together",
                ));
            }
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsContext {
            connector: TlsConnector::from(Arc::new(config)),
            fingerprint,
            server_hostname: self.server_hostname.clone(),
            assert_hostname: self.assert_hostname.clone(),
            verify: self.verify,
        })
    }

    fn load_roots(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();

        if let Some(ref path) = self.ca_certs {
            for cert in load_pem_certs(path)? {
                roots.add(cert).map_err(Error::new_tls)?;
            }
        }
        if let Some(ref dir) = self.ca_cert_dir {
            let entries = std::fs::read_dir(dir).map_err(Error::new_tls)?;
            for entry in entries {
                let path = entry.map_err(Error::new_tls)?.path();
                let is_pem = path
                    .extension()
                    .map(|ext| ext == "pem" || ext == "crt")
                    .unwrap_or(false);
                if is_pem {
                    for cert in load_pem_certs(&path)? {
                        roots.add(cert).map_err(Error::new_tls)?;
                    }
                }
            }
        }

        if roots.is_empty() {
            if let Ok(native) = rustls_native_certs::load_native_certs() {
                for cert in native {
                    // some system stores carry stale or malformed entries
                    let _ = roots.add(cert);
                }
            }
        }
        if roots.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        Ok(roots)
    }
}

/// A compiled TLS context: one `rustls` config plus the checks rustls
/// cannot express.
#[derive(Clone)]
pub(crate) struct TlsContext {
    connector: TlsConnector,
    fingerprint: Option<Fingerprint>,
    server_hostname: Option<String>,
    assert_hostname: AssertHostname,
    verify: bool,
}

impl TlsContext {
    /// Upgrades a TCP stream, verifying the peer per the configuration.
    ///
    /// `default_host` is the host we believe we are talking to: the tunnel
    /// host when proxied, otherwise the connected host.
    pub(crate) async fn handshake(
        &self,
        tcp: TcpStream,
        default_host: &str,
    ) -> Result<TlsStream<TcpStream>> {
        warn_if_clock_is_off();
        if !self.verify {
            warn_insecure();
        }

        let name = self
            .server_hostname
            .as_deref()
            .or(match self.assert_hostname {
                AssertHostname::Override(ref hostname) => Some(hostname.as_str()),
                _ => None,
            })
            .unwrap_or(default_host);
        let name = normalize_host(name);

        let server_name = match name.parse::<IpAddr>() {
            Ok(ip) => ServerName::IpAddress(ip.into()),
            Err(_) => ServerName::try_from(name.to_owned())
                .map_err(|_| Error::new_tls_msg("invalid server name for TLS handshake"))?,
        };

        let stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(Error::new_tls)?;

        if let Some(ref fingerprint) = self.fingerprint {
            let (_, session) = stream.get_ref();
            let cert = session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or_else(|| Error::new_tls_msg("no peer certificate to pin against"))?;
            fingerprint.matches(cert.as_ref())?;
        }

        Ok(stream)
    }

    /// Whether a completed handshake counts as verified.
    pub(crate) fn is_verified(&self) -> bool {
        self.fingerprint.is_some() || self.verify
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("verify", &self.verify)
            .field("fingerprint", &self.fingerprint)
            .field("server_hostname", &self.server_hostname)
            .finish()
    }
}

/// Trailing dots are DNS detail; brackets belong to URL syntax, not names.
fn normalize_host(host: &str) -> &str {
    host.trim_end_matches('.')
        .trim_start_matches('[')
        .trim_end_matches(']')
}

fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(Error::new_tls)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(Error::new_tls)
}

fn load_pem_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(Error::new_tls)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(Error::new_tls)?
        .ok_or_else(|| Error::new_tls_msg("no private key found in key file"))
}

/// A certificate pin: a digest algorithm (selected by digest length) and
/// the expected bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Fingerprint {
    algorithm: Algorithm,
    digest: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Sha1,
    Sha256,
}

impl Fingerprint {
    pub(crate) fn parse(raw: &str) -> Result<Fingerprint> {
        let hex: String = raw.chars().filter(|c| *c != ':').collect();
        if hex.len() % 2 != 0 {
            return Err(Error::new_tls_msg("fingerprint has an odd number of hex digits"));
        }
        let mut digest = Vec::with_capacity(hex.len() / 2);
        for pair in hex.as_bytes().chunks(2) {
            let pair = std::str::from_utf8(pair).expect("hex is ASCII");
            let byte = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::new_tls_msg("fingerprint contains non-hex characters"))?;
            digest.push(byte);
        }
        let algorithm = match digest.len() {
            16 => Algorithm::Md5,
            20 => Algorithm::Sha1,
            32 => Algorithm::Sha256,
            _ => return Err(Error::new_tls_msg("fingerprint of unsupported digest length")),
        };
        Ok(Fingerprint { algorithm, digest })
    }

    pub(crate) fn matches(&self, cert_der: &[u8]) -> Result<()> {
        let computed = match self.algorithm {
            Algorithm::Md5 => Md5::digest(cert_der).to_vec(),
            Algorithm::Sha1 => Sha1::digest(cert_der).to_vec(),
            Algorithm::Sha256 => Sha256::digest(cert_der).to_vec(),
        };
        if constant_time_eq(&computed, &self.digest) {
            Ok(())
        } else {
            Err(Error::new_tls(format!(
                "certificate fingerprint mismatch: expected {}, got {}",
                hex_string(&self.digest),
                hex_string(&computed),
            )))
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Accepts any certificate. Used for fingerprint pinning (where the pin is
/// the whole trust decision) and for explicitly disabled verification.
#[derive(Debug)]
struct AcceptAll(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAll {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
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
            &self.0.signature_verification_algorithms,
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
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Full chain verification, but any hostname is acceptable.
#[derive(Debug)]
struct AnyHostname(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for AnyHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        use rustls::CertificateError::{NotValidForName, NotValidForNameContext};
        match self
            .0
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(NotValidForName))
            | Err(rustls::Error::InvalidCertificate(NotValidForNameContext { .. })) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

/// Certificate validity windows make a badly set clock look like a broken
/// chain. Warned once per process.
fn warn_if_clock_is_off() {
    static WARNED: Once = Once::new();
    let today = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / 86_400)
        .unwrap_or(0);
    if today < RECENT_DATE_DAYS {
        WARNED.call_once(|| {
            warn!(
                "system time is before {}; certificate verification will likely fail",
                RECENT_DATE_LABEL
            );
        });
    }
}

fn warn_insecure() {
    static WARNED: Once = Once::new();
    WARNED.call_once(|| {
        warn!("certificate verification is disabled; connections are vulnerable to interception");
    });
}

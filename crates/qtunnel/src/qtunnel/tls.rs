//! rustls material for the QUIC transport: PEM loading, mutual-TLS server and
//! client configs, and a throwaway self-signed identity for development.

use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use rcgen::generate_simple_self_signed;
use rustls::{
    RootCertStore,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    server::WebPkiClientVerifier,
};

#[derive(Debug, Clone, Default)]
pub struct ServerTlsOptions {
    pub cert_file: String,
    pub key_file: String,
    /// CA bundle used to verify client certificates. Empty disables client auth.
    pub client_ca_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptions {
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

pub type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub fn server_crypto_config(
    opts: &ServerTlsOptions,
    alpn: Vec<Vec<u8>>,
) -> anyhow::Result<rustls::ServerConfig> {
    let (certs, key) = load_or_generate_identity(&opts.cert_file, &opts.key_file)?;

    let builder = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("tls: server protocol versions")?;

    let builder = if opts.client_ca_file.trim().is_empty() {
        builder.with_no_client_auth()
    } else {
        let roots = load_roots(Path::new(opts.client_ca_file.trim()))?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
            .build()
            .context("tls: build client verifier")?;
        builder.with_client_cert_verifier(verifier)
    };

    let mut cfg = builder
        .with_single_cert(certs, key)
        .context("tls: server certificate")?;
    cfg.alpn_protocols = alpn;
    Ok(cfg)
}

pub fn client_crypto_config(
    opts: &ClientTlsOptions,
    alpn: Vec<Vec<u8>>,
) -> anyhow::Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("tls: client protocol versions")?;

    let builder = if opts.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
    } else {
        if opts.ca_file.trim().is_empty() {
            anyhow::bail!("tls: a CA file is required unless insecure_skip_verify is set");
        }
        builder.with_root_certificates(load_roots(Path::new(opts.ca_file.trim()))?)
    };

    let cert_file = opts.cert_file.trim();
    let key_file = opts.key_file.trim();
    let mut cfg = match (cert_file.is_empty(), key_file.is_empty()) {
        (true, true) => builder.with_no_client_auth(),
        (false, false) => {
            let certs = load_certs(Path::new(cert_file))?;
            let key = load_key(Path::new(key_file))?;
            builder
                .with_client_auth_cert(certs, key)
                .context("tls: client certificate")?
        }
        _ => anyhow::bail!("tls: client identity requires both cert_file and cert_key"),
    };
    cfg.alpn_protocols = alpn;
    Ok(cfg)
}

/// Load the configured identity, or mint a self-signed `localhost` one when
/// neither file is set.
pub fn load_or_generate_identity(cert_file: &str, key_file: &str) -> anyhow::Result<Identity> {
    let cert_file = cert_file.trim();
    let key_file = key_file.trim();

    if !cert_file.is_empty() || !key_file.is_empty() {
        if cert_file.is_empty() || key_file.is_empty() {
            anyhow::bail!("tls: requires both cert_file and cert_key (or neither to auto-generate)");
        }
        let certs = load_certs(Path::new(cert_file))?;
        let key = load_key(Path::new(key_file))?;
        return Ok((certs, key));
    }

    tracing::warn!("tls: no certificate configured; using a generated self-signed certificate");
    generate_self_signed(&["localhost"])
}

pub fn generate_self_signed(names: &[&str]) -> anyhow::Result<Identity> {
    let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let rcgen::CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(names).context("tls: generate self-signed certificate")?;
    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    Ok((vec![cert_der], key_der))
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("tls: parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificates found in {}", path.display());
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)
        .with_context(|| format!("tls: parse private key in {}", path.display()))?;
    let Some(k) = key else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(k)
}

pub fn load_roots(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .with_context(|| format!("tls: add CA certificate from {}", path.display()))?;
    }
    Ok(roots)
}

/// Certificate verifier that accepts any server certificate.
///
/// NOTE: vulnerable to MITM. Intended for local dev / testing only.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use super::*;

    pub(crate) fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("qtunnel_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    /// Writes a self-signed cert/key pair for `names` and returns their paths.
    pub(crate) fn write_self_signed(dir: &Path, stem: &str, names: &[&str]) -> (String, String) {
        let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(names).expect("rcgen");
        let cert_path = dir.join(format!("{stem}.crt"));
        let key_path = dir.join(format!("{stem}.key"));
        std::fs::write(&cert_path, cert.pem()).expect("write cert");
        std::fs::write(&key_path, signing_key.serialize_pem()).expect("write key");
        (
            cert_path.display().to_string(),
            key_path.display().to_string(),
        )
    }

    #[test]
    fn loads_pem_identity_and_roots() {
        let dir = temp_dir("tls_load");
        let (cert, key) = write_self_signed(&dir, "server", &["localhost"]);

        let (certs, _key) = load_or_generate_identity(&cert, &key).expect("identity");
        assert_eq!(certs.len(), 1);
        let roots = load_roots(Path::new(&cert)).expect("roots");
        assert_eq!(roots.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn half_configured_identity_is_rejected() {
        let dir = temp_dir("tls_half");
        let (cert, _key) = write_self_signed(&dir, "server", &["localhost"]);

        let err = load_or_generate_identity(&cert, "").unwrap_err();
        assert!(err.to_string().contains("both"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn key_file_without_key_is_rejected() {
        let dir = temp_dir("tls_nokey");
        let (cert, _key) = write_self_signed(&dir, "server", &["localhost"]);

        let err = load_key(Path::new(&cert)).unwrap_err();
        assert!(err.to_string().contains("no private key"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn builds_mutual_tls_configs() {
        let dir = temp_dir("tls_mtls");
        let (srv_cert, srv_key) = write_self_signed(&dir, "server", &["localhost"]);
        let (cli_cert, cli_key) = write_self_signed(&dir, "client", &["client"]);

        let server = server_crypto_config(
            &ServerTlsOptions {
                cert_file: srv_cert.clone(),
                key_file: srv_key,
                client_ca_file: cli_cert.clone(),
            },
            vec![b"qtunnel".to_vec()],
        )
        .expect("server config");
        assert_eq!(server.alpn_protocols, vec![b"qtunnel".to_vec()]);

        client_crypto_config(
            &ClientTlsOptions {
                ca_file: srv_cert,
                cert_file: cli_cert,
                key_file: cli_key,
                server_name: "localhost".into(),
                insecure_skip_verify: false,
            },
            vec![b"qtunnel".to_vec()],
        )
        .expect("client config");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn client_without_ca_requires_insecure_flag() {
        let opts = ClientTlsOptions::default();
        assert!(client_crypto_config(&opts, vec![]).is_err());

        let opts = ClientTlsOptions {
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(client_crypto_config(&opts, vec![]).is_ok());
    }
}

//! Certificate authority for HTTPS interception
//!
//! Loads or mints a long-lived root and issues short-lived per-host leaf
//! certificates, cached so repeated CONNECTs to the same host do not pay the
//! minting cost on every handshake.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf certificate validity in seconds (1 year)
const LEAF_TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Leaf cache time-to-live in seconds (half the leaf validity)
const CACHE_TTL: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Offset for not_before timestamps to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Root validity in days (10 years)
const ROOT_VALIDITY_DAYS: i64 = 3650;
/// Root key size in bits
const ROOT_KEY_BITS: usize = 2048;

const CA_CERT_FILE: &str = "wiretap-ca-cert.pem";
const CA_KEY_FILE: &str = "wiretap-ca-key.pem";
const CA_DER_FILE: &str = "wiretap-ca-cert.crt";

/// Result of the best-effort OS trust-store probe
#[derive(Debug, Clone)]
pub struct TrustStatus {
  /// `Some(true)` when the root is trusted, `Some(false)` when it is
  /// provably absent, `None` when the platform gives no answer
  pub trusted: Option<bool>,
  /// Human-readable explanation
  pub message: String,
}

/// Snapshot of the authority state for status reporting
#[derive(Debug, Clone)]
pub struct CaStatus {
  /// Whether a root is loaded
  pub loaded: bool,
  /// Subject common name of the root
  pub subject: String,
  /// Start of the root validity window
  pub not_before: Option<String>,
  /// End of the root validity window
  pub not_after: Option<String>,
  /// Durable path of the root certificate
  pub cert_path: PathBuf,
  /// OS trust-store probe result
  pub trust: TrustStatus,
}

/// Root key material plus the issuer handle used to sign leafs
pub struct CertificateAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  ca_cert_pem: String,
  storage_path: PathBuf,
}

impl CertificateAuthority {
  /// Load a persisted root from the storage directory, or generate a new
  /// self-signed one and persist it
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();
    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);

    if cert_path.exists() && key_path.exists() {
      let cert_pem = fs::read_to_string(&cert_path).await?;
      let key_pem = fs::read_to_string(&key_path).await?;
      Self::from_pem(&key_pem, &cert_pem, storage_path)
    } else {
      let (key_pem, cert_pem) = generate_root()?;
      let ca = Self::from_pem(&key_pem, &cert_pem, storage_path)?;
      ca.persist(&key_pem, &cert_pem).await?;
      tracing::info!("generated new root CA at {:?}", ca.cert_path());
      Ok(ca)
    }
  }

  /// Build an authority from externally supplied PEM blobs.
  ///
  /// Used both on startup load and on user import; the pair is validated by
  /// actually constructing the issuer.
  pub fn from_pem(key_pem: &str, cert_pem: &str, storage_path: PathBuf) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to build issuer from CA cert: {}", e)))?;
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in PEM"))?
      .map_err(|e| Error::certificate(format!("failed to parse CA cert PEM: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
      storage_path,
    })
  }

  /// Persist the pair atomically: write temp files, then rename over the
  /// durable names. Also refreshes the DER copy used by installers.
  pub async fn persist(&self, key_pem: &str, cert_pem: &str) -> Result<()> {
    if !self.storage_path.exists() {
      fs::create_dir_all(&self.storage_path).await?;
    }
    let cert_path = self.storage_path.join(CA_CERT_FILE);
    let key_path = self.storage_path.join(CA_KEY_FILE);
    let der_path = self.storage_path.join(CA_DER_FILE);

    let cert_tmp = cert_path.with_extension("pem.tmp");
    let key_tmp = key_path.with_extension("pem.tmp");
    fs::write(&cert_tmp, cert_pem).await?;
    fs::write(&key_tmp, key_pem).await?;
    fs::rename(&cert_tmp, &cert_path).await?;
    fs::rename(&key_tmp, &key_path).await?;
    fs::write(&der_path, self.ca_cert_der.as_ref()).await?;
    Ok(())
  }

  /// Issue a leaf for the given hostname, signed by this root.
  ///
  /// CN is the hostname; the SAN covers it as DNS, plus an IP SAN when the
  /// hostname is an IP literal. Returns the chain [leaf, root] and the leaf
  /// key, ready for a rustls server config.
  pub fn issue_leaf(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns) = host.try_into() {
        sans.push(SanType::DnsName(dns));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid hostname: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {}: {}", host, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }

  /// Root certificate in PEM form
  pub fn cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Durable path of the root certificate
  pub fn cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }

  /// Subject common name and validity window, parsed from the root
  fn root_fields(&self) -> (String, Option<String>, Option<String>) {
    match x509_parser::parse_x509_certificate(self.ca_cert_der.as_ref()) {
      Ok((_, cert)) => {
        let subject = cert
          .subject()
          .iter_common_name()
          .next()
          .and_then(|cn| cn.as_str().ok())
          .unwrap_or_default()
          .to_string();
        let validity = cert.validity();
        (
          subject,
          Some(validity.not_before.to_datetime().to_string()),
          Some(validity.not_after.to_datetime().to_string()),
        )
      }
      Err(_) => (String::new(), None, None),
    }
  }
}

/// Generate a self-signed root: 2048-bit RSA, 10-year validity, CA basic
/// constraints with key-cert-sign usage
fn generate_root() -> Result<(String, String)> {
  let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), ROOT_KEY_BITS)
    .map_err(|e| Error::certificate(format!("failed to generate root key: {}", e)))?;
  let key_pem = rsa_key
    .to_pkcs8_pem(LineEnding::LF)
    .map_err(|e| Error::certificate(format!("failed to encode root key: {}", e)))?;
  let key_pair = KeyPair::from_pem(&key_pem)
    .map_err(|e| Error::certificate(format!("failed to load generated root key: {}", e)))?;

  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "Wiretap Root CA");
  dn.push(DnType::OrganizationName, "Wiretap");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

  let now = OffsetDateTime::now_utc();
  params.not_before = now;
  params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| Error::certificate(format!("failed to self-sign root: {}", e)))?;

  Ok((key_pem.to_string(), cert.pem()))
}

/// Authority plus the per-host leaf cache.
///
/// Concurrent misses on the same host may redundantly mint; the cache keeps
/// whichever insert lands last, which is harmless since every leaf is signed
/// by the same root.
pub struct CertificateManager {
  ca: tokio::sync::RwLock<CertificateAuthority>,
  cert_cache: Cache<String, Arc<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>>,
}

impl CertificateManager {
  /// Load or create the root under the given storage directory
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let ca = CertificateAuthority::load_or_generate(storage_path).await?;
    let cert_cache = Cache::builder()
      .max_capacity(1000)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Ok(Self {
      ca: tokio::sync::RwLock::new(ca),
      cert_cache,
    })
  }

  /// Return the cached leaf for the host or mint a new one
  pub async fn leaf_for_host(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if let Some(cached) = self.cert_cache.get(host).await {
      let (chain, key) = cached.as_ref();
      return Ok((chain.clone(), key.clone_key()));
    }

    let (chain, key) = self.ca.read().await.issue_leaf(host)?;
    self
      .cert_cache
      .insert(host.to_string(), Arc::new((chain.clone(), key.clone_key())))
      .await;
    Ok((chain, key))
  }

  /// Replace the root with externally supplied key and certificate PEM,
  /// persist atomically, and drop every cached leaf
  pub async fn import(&self, key_pem: &str, cert_pem: &str) -> Result<()> {
    let storage_path = self.ca.read().await.storage_path.clone();
    let replacement = CertificateAuthority::from_pem(key_pem, cert_pem, storage_path)?;
    replacement.persist(key_pem, cert_pem).await?;
    *self.ca.write().await = replacement;
    self.cert_cache.invalidate_all();
    tracing::info!("imported root CA");
    Ok(())
  }

  /// Root certificate in PEM form, for client installation
  pub async fn ca_cert_pem(&self) -> String {
    self.ca.read().await.cert_pem().to_string()
  }

  /// Durable path of the root certificate
  pub async fn ca_cert_path(&self) -> PathBuf {
    self.ca.read().await.cert_path()
  }

  /// Status snapshot including the best-effort trust probe
  pub async fn status(&self) -> CaStatus {
    let ca = self.ca.read().await;
    let (subject, not_before, not_after) = ca.root_fields();
    let cert_path = ca.cert_path();
    let trust = probe_trust(&cert_path, ca.cert_pem());
    CaStatus {
      loaded: true,
      subject,
      not_before,
      not_after,
      cert_path,
      trust,
    }
  }
}

/// Ask the host OS whether the root is trusted. Best effort only: an
/// affirmative or negative answer where the platform offers one, unknown
/// everywhere else.
fn probe_trust(cert_path: &Path, cert_pem: &str) -> TrustStatus {
  #[cfg(target_os = "macos")]
  {
    let _ = cert_pem;
    let output = std::process::Command::new("security")
      .args(["verify-cert", "-p", "ssl", "-L", "-c"])
      .arg(cert_path)
      .output();
    match output {
      Ok(out) if out.status.success() => TrustStatus {
        trusted: Some(true),
        message: "root is trusted for SSL".to_string(),
      },
      Ok(out) => TrustStatus {
        trusted: Some(false),
        message: format!(
          "verify-cert rejected the root: {}",
          String::from_utf8_lossy(&out.stderr).trim()
        ),
      },
      Err(e) => TrustStatus {
        trusted: None,
        message: format!("could not run security verify-cert: {}", e),
      },
    }
  }

  #[cfg(target_os = "linux")]
  {
    let _ = cert_path;
    let bundles = [
      "/etc/ssl/certs/ca-certificates.crt",
      "/etc/pki/tls/certs/ca-bundle.crt",
      "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
      "/etc/ssl/ca-bundle.pem",
    ];
    let mut scanned = false;
    for bundle in bundles {
      if let Ok(content) = std::fs::read_to_string(bundle) {
        scanned = true;
        if content.contains(cert_pem.trim()) {
          return TrustStatus {
            trusted: Some(true),
            message: format!("root present in {}", bundle),
          };
        }
      }
    }
    if scanned {
      TrustStatus {
        trusted: Some(false),
        message: "root not found in any system CA bundle".to_string(),
      }
    } else {
      TrustStatus {
        trusted: None,
        message: "no readable system CA bundle".to_string(),
      }
    }
  }

  #[cfg(not(any(target_os = "macos", target_os = "linux")))]
  {
    let _ = (cert_path, cert_pem);
    TrustStatus {
      trusted: None,
      message: "trust check not supported on this platform".to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn root_is_rsa_ca_with_long_validity() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CertificateManager::new(dir.path()).await.unwrap();
    let pem = manager.ca_cert_pem().await;
    assert!(pem.contains("BEGIN CERTIFICATE"));

    let ca = manager.ca.read().await;
    let (_, cert) = x509_parser::parse_x509_certificate(ca.ca_cert_der.as_ref()).unwrap();
    let constraints = cert.basic_constraints().unwrap().expect("root must carry basic constraints");
    assert!(constraints.value.ca);
    let days = (cert.validity().not_after.to_datetime() - cert.validity().not_before.to_datetime())
      .whole_days();
    assert!(days >= ROOT_VALIDITY_DAYS - 1);
    let (subject, not_before, not_after) = ca.root_fields();
    assert_eq!(subject, "Wiretap Root CA");
    assert!(not_before.is_some());
    assert!(not_after.is_some());
  }

  #[tokio::test]
  async fn root_is_reloaded_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let first = CertificateManager::new(dir.path()).await.unwrap();
    let first_pem = first.ca_cert_pem().await;
    drop(first);

    let second = CertificateManager::new(dir.path()).await.unwrap();
    assert_eq!(second.ca_cert_pem().await, first_pem);
  }

  #[tokio::test]
  async fn leaf_san_covers_hostname() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CertificateManager::new(dir.path()).await.unwrap();
    let (chain, _key) = manager.leaf_for_host("secure.test").await.unwrap();
    assert_eq!(chain.len(), 2);

    let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref()).unwrap();
    let cn = leaf
      .subject()
      .iter_common_name()
      .next()
      .and_then(|c| c.as_str().ok())
      .unwrap();
    assert_eq!(cn, "secure.test");

    let san = leaf
      .subject_alternative_name()
      .unwrap()
      .expect("leaf should carry a SAN");
    let has_dns = san.value.general_names.iter().any(|name| {
      matches!(name, x509_parser::extensions::GeneralName::DNSName(d) if *d == "secure.test")
    });
    assert!(has_dns);
  }

  #[tokio::test]
  async fn ip_literal_gets_ip_san() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CertificateManager::new(dir.path()).await.unwrap();
    let (chain, _key) = manager.leaf_for_host("127.0.0.1").await.unwrap();

    let (_, leaf) = x509_parser::parse_x509_certificate(chain[0].as_ref()).unwrap();
    let san = leaf.subject_alternative_name().unwrap().unwrap();
    let has_ip = san
      .value
      .general_names
      .iter()
      .any(|name| matches!(name, x509_parser::extensions::GeneralName::IPAddress(_)));
    assert!(has_ip);
  }

  #[tokio::test]
  async fn leaf_cache_returns_usable_config() {
    use tokio_rustls::rustls::ServerConfig;

    let dir = tempfile::tempdir().unwrap();
    let manager = CertificateManager::new(dir.path()).await.unwrap();

    for _ in 0..3 {
      let (chain, key) = manager.leaf_for_host("cached.test").await.unwrap();
      let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key);
      assert!(config.is_ok(), "cached leaf must pair with its key");
    }
  }

  #[tokio::test]
  async fn import_replaces_root_and_invalidates_leafs() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let manager = CertificateManager::new(dir_a.path()).await.unwrap();
    let _ = manager.leaf_for_host("pre.test").await.unwrap();

    // generate a second root elsewhere and import its pair
    let other = CertificateAuthority::load_or_generate(dir_b.path()).await.unwrap();
    let other_pem = other.cert_pem().to_string();
    let other_key = std::fs::read_to_string(dir_b.path().join(CA_KEY_FILE)).unwrap();

    manager.import(&other_key, &other_pem).await.unwrap();
    assert_eq!(manager.ca_cert_pem().await, other_pem);
    // persisted to the original storage dir
    let on_disk = std::fs::read_to_string(dir_a.path().join(CA_CERT_FILE)).unwrap();
    assert_eq!(on_disk, other_pem);

    // leafs minted after import chain to the new root
    let (chain, _) = manager.leaf_for_host("pre.test").await.unwrap();
    assert_eq!(chain[1].as_ref(), other.ca_cert_der.as_ref());
  }
}

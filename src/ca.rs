// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use anyhow::{Context, Result, anyhow, bail};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    PKCS_ECDSA_P256_SHA256, SerialNumber,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Issues per-hostname leaf certificates signed by the configured root CA,
/// caching them as `<certs_dir>/<hostname>.crt`.
///
/// Every leaf shares one proxy-held key; only the certificate differs.
pub struct CertificateAuthority {
    ca_cert_path: PathBuf,
    ca_key_path: PathBuf,
    certs_dir: PathBuf,
    leaf_key: KeyPair,
    /// Serialises generation across all hostnames.
    generate_lock: Mutex<()>,
    serial: AtomicU64,
    minted: AtomicU64,
}

impl CertificateAuthority {
    /// Opens existing CA material, failing if any of it is missing or unparseable.
    pub fn open(
        ca_cert_path: &Path,
        ca_key_path: &Path,
        leaf_key_path: &Path,
        certs_dir: &Path,
    ) -> Result<Self> {
        info!("Loading CA from {:?}", ca_cert_path);
        // Parse once now so bad material stops startup
        load_issuer(ca_cert_path, ca_key_path)?;

        let leaf_pem = fs::read_to_string(leaf_key_path)
            .with_context(|| format!("failed to read leaf key {:?}", leaf_key_path))?;
        let leaf_key =
            KeyPair::from_pem(&leaf_pem).context("failed to parse leaf key pair from PEM")?;

        fs::create_dir_all(certs_dir)
            .with_context(|| format!("failed to create cert cache {:?}", certs_dir))?;

        Ok(Self {
            ca_cert_path: ca_cert_path.to_path_buf(),
            ca_key_path: ca_key_path.to_path_buf(),
            certs_dir: certs_dir.to_path_buf(),
            leaf_key,
            generate_lock: Mutex::new(()),
            serial: AtomicU64::new(0),
            minted: AtomicU64::new(0),
        })
    }

    /// Generates whichever of the CA certificate, CA key and leaf key are missing.
    /// Returns true if anything was written.
    pub fn bootstrap(
        ca_cert_path: &Path,
        ca_key_path: &Path,
        leaf_key_path: &Path,
    ) -> Result<bool> {
        let mut wrote = false;
        if !(ca_cert_path.exists() && ca_key_path.exists()) {
            info!("Generating new CA at {:?}", ca_cert_path);
            let mut params = CertificateParams::new(vec![])?;
            params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
            params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
            params.distinguished_name = DistinguishedName::new();
            params
                .distinguished_name
                .push(DnType::CommonName, "proxenet CA");
            params
                .distinguished_name
                .push(DnType::OrganizationName, "proxenet");

            let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
            let cert = params.self_signed(&key_pair)?;
            write_creating_parent(ca_cert_path, cert.pem().as_bytes())?;
            write_creating_parent(ca_key_path, key_pair.serialize_pem().as_bytes())?;
            wrote = true;
        }
        if !leaf_key_path.exists() {
            info!("Generating leaf key at {:?}", leaf_key_path);
            let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
            write_creating_parent(leaf_key_path, key_pair.serialize_pem().as_bytes())?;
            wrote = true;
        }
        Ok(wrote)
    }

    /// Deterministic cache location for `hostname`.
    pub fn cert_path(&self, hostname: &str) -> PathBuf {
        self.certs_dir.join(format!("{}.crt", hostname))
    }

    /// Returns the path of a leaf certificate for `hostname`, minting it on first use.
    pub fn obtain_certificate(&self, hostname: &str) -> Result<PathBuf> {
        validate_hostname(hostname)?;
        let path = self.cert_path(hostname);

        if is_readable_file(&path) {
            debug!(%hostname, "certificate cache hit");
            return Ok(path);
        }

        let _guard = self
            .generate_lock
            .lock()
            .map_err(|e| anyhow!("CA generation mutex poisoned: {}", e))?;

        // another session may have finished it while we waited
        if is_readable_file(&path) {
            debug!(%hostname, "certificate generated concurrently");
            return Ok(path);
        }

        self.generate(hostname, &path)?;
        Ok(path)
    }

    fn generate(&self, hostname: &str, path: &Path) -> Result<()> {
        let mut template = CertificateParams::new(vec![hostname.to_string()])
            .with_context(|| format!("invalid hostname for certificate: {}", hostname))?;
        template.distinguished_name = leaf_subject(hostname);
        let csr = template
            .serialize_request(&self.leaf_key)
            .context("failed to build certificate signing request")?;

        let issuer = load_issuer(&self.ca_cert_path, &self.ca_key_path)?;
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;

        let mut request = CertificateSigningRequestParams::from_der(csr.der())
            .context("failed to parse certificate signing request")?;
        if request.params.subject_alt_names.is_empty() {
            request.params.subject_alt_names = template.subject_alt_names.clone();
        }
        request.params.serial_number = Some(SerialNumber::from(serial));
        request.params.not_before = rcgen::date_time_ymd(2001, 1, 1);
        request.params.not_after = rcgen::date_time_ymd(2030, 12, 31);
        request.params.is_ca = IsCa::ExplicitNoCa;
        request.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        request.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        request.params.use_authority_key_identifier_extension = true;

        let cert = request
            .signed_by(&issuer)
            .with_context(|| format!("failed to sign certificate for {}", hostname))?;

        // readers check for the file without the lock, so it must appear whole
        let tmp = path.with_extension(format!("crt.{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp, cert.pem())
            .with_context(|| format!("failed to write certificate {:?}", tmp))?;
        fs::rename(&tmp, path).with_context(|| format!("failed to persist {:?}", path))?;

        self.minted.fetch_add(1, Ordering::SeqCst);
        info!(%hostname, serial, path = ?path, "minted leaf certificate");
        Ok(())
    }

    /// Private key matching every minted leaf, for the TLS server config.
    pub fn leaf_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.leaf_key.serialize_der()))
    }

    /// Number of leaf certificates generated by this process.
    pub fn certificates_minted(&self) -> u64 {
        self.minted.load(Ordering::SeqCst)
    }

    pub fn ca_cert_path(&self) -> &Path {
        &self.ca_cert_path
    }

    pub fn ca_key_path(&self) -> &Path {
        &self.ca_key_path
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }
}

fn leaf_subject(hostname: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    dn.push(DnType::OrganizationalUnitName, "proxenet");
    dn.push(DnType::OrganizationName, "proxenet interception");
    dn.push(DnType::CountryName, "US");
    dn
}

fn load_issuer(ca_cert_path: &Path, ca_key_path: &Path) -> Result<Issuer<'static, KeyPair>> {
    let cert_pem = fs::read_to_string(ca_cert_path)
        .with_context(|| format!("failed to read CA cert {:?}", ca_cert_path))?;
    let key_pem = fs::read_to_string(ca_key_path)
        .with_context(|| format!("failed to read CA key {:?}", ca_key_path))?;
    let key_pair = KeyPair::from_pem(&key_pem).context("failed to parse CA key pair from PEM")?;
    Issuer::from_ca_cert_pem(&cert_pem, key_pair).context("failed to parse CA certificate")
}

/// Hostnames become file names, so only DNS and IP literal characters are allowed.
fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 253
        && !hostname.starts_with('.')
        && !hostname.contains("..")
        && hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'));
    if !valid {
        bail!("refusing to mint certificate for hostname {:?}", hostname);
    }
    Ok(())
}

fn is_readable_file(path: &Path) -> bool {
    fs::File::open(path)
        .and_then(|f| f.metadata())
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn write_creating_parent(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("failed to write {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::TestPki;
    use anyhow::Result;
    use rstest::rstest;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn bootstrap_generates_missing_material() -> Result<()> {
        let pki = TestPki::empty();
        assert!(CertificateAuthority::bootstrap(&pki.ca_cert, &pki.ca_key, &pki.leaf_key)?);
        assert!(pki.ca_cert.exists());
        assert!(pki.ca_key.exists());
        assert!(pki.leaf_key.exists());

        let pem = fs::read_to_string(&pki.ca_cert)?;
        assert!(pem.contains("BEGIN CERTIFICATE"));

        // second run leaves existing files alone
        assert!(!CertificateAuthority::bootstrap(&pki.ca_cert, &pki.ca_key, &pki.leaf_key)?);
        assert_eq!(fs::read_to_string(&pki.ca_cert)?, pem);
        Ok(())
    }

    #[test]
    fn open_fails_without_ca_files() {
        let pki = TestPki::empty();
        assert!(
            CertificateAuthority::open(&pki.ca_cert, &pki.ca_key, &pki.leaf_key, &pki.certs_dir)
                .is_err()
        );
    }

    #[test]
    fn open_fails_on_garbage_key() -> Result<()> {
        let pki = TestPki::generate()?;
        fs::write(&pki.ca_key, "not a key")?;
        assert!(pki.open().is_err());
        Ok(())
    }

    #[test]
    fn obtain_certificate_writes_pem_to_cache() -> Result<()> {
        let pki = TestPki::generate()?;
        let ca = pki.open()?;

        let path = ca.obtain_certificate("example.com")?;
        assert_eq!(path, pki.certs_dir.join("example.com.crt"));
        let pem = fs::read_to_string(&path)?;
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(ca.certificates_minted(), 1);
        Ok(())
    }

    #[test]
    fn cache_hit_does_not_regenerate() -> Result<()> {
        let pki = TestPki::generate()?;
        let ca = pki.open()?;

        let first = ca.obtain_certificate("example.com")?;
        let pem1 = fs::read_to_string(&first)?;
        let second = ca.obtain_certificate("example.com")?;
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&second)?, pem1);
        assert_eq!(ca.certificates_minted(), 1);
        Ok(())
    }

    #[test]
    fn distinct_hosts_get_distinct_entries() -> Result<()> {
        let pki = TestPki::generate()?;
        let ca = pki.open()?;

        let a = ca.obtain_certificate("example.com")?;
        let b = ca.obtain_certificate("example.org")?;
        let c = ca.obtain_certificate("127.0.0.1")?;
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(fs::read_to_string(&a)?, fs::read_to_string(&b)?);
        assert_eq!(ca.certificates_minted(), 3);
        Ok(())
    }

    #[test]
    fn serials_count_up_from_one() -> Result<()> {
        let pki = TestPki::generate()?;
        let ca = pki.open()?;

        let serial = |host: &str| -> Result<Vec<u8>> {
            let pem = fs::read_to_string(ca.obtain_certificate(host)?)?;
            let params = CertificateParams::from_ca_cert_pem(&pem)?;
            let serial = params.serial_number.context("leaf has no serial")?;
            Ok(serial.to_bytes().into_iter().skip_while(|b| *b == 0).collect())
        };
        assert_eq!(serial("one.test")?, vec![1]);
        assert_eq!(serial("two.test")?, vec![2]);
        Ok(())
    }

    #[test]
    fn concurrent_requests_generate_once() -> Result<()> {
        let pki = TestPki::generate()?;
        let ca = Arc::new(pki.open()?);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ca = ca.clone();
                thread::spawn(move || ca.obtain_certificate("race.example"))
            })
            .collect();
        let mut paths = Vec::new();
        for h in handles {
            let path = h.join().map_err(|_| anyhow!("worker panicked"))??;
            paths.push(path);
        }

        assert_eq!(ca.certificates_minted(), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert!(fs::read_to_string(&paths[0])?.contains("BEGIN CERTIFICATE"));
        Ok(())
    }

    #[test]
    fn minted_leaf_loads_into_rustls() -> Result<()> {
        let pki = TestPki::generate()?;
        let ca = pki.open()?;
        let path = ca.obtain_certificate("example.com")?;
        let certs = rustls_pemfile::certs(&mut fs::read(&path)?.as_slice())
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(certs.len(), 1);
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, ca.leaf_key_der());
        assert!(config.is_ok());
        Ok(())
    }

    #[rstest]
    #[case("")]
    #[case("../etc/passwd")]
    #[case("a/b")]
    #[case(".hidden")]
    #[case("host name")]
    fn unsafe_hostnames_are_refused(#[case] host: &str) -> Result<()> {
        let pki = TestPki::generate()?;
        let ca = pki.open()?;
        assert!(ca.obtain_certificate(host).is_err());
        assert_eq!(ca.certificates_minted(), 0);
        Ok(())
    }
}

// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Shared test utilities to reduce duplication across test modules.

use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::hooks::EngineSet;
use crate::runtime::ProxyRuntime;
use std::path::PathBuf;
use uuid::Uuid;

/// Throwaway CA material under a unique temp directory, removed on drop.
pub struct TestPki {
    pub root: PathBuf,
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub leaf_key: PathBuf,
    pub certs_dir: PathBuf,
}

impl TestPki {
    /// Paths only; nothing is written.
    pub fn empty() -> Self {
        let root = std::env::temp_dir().join(format!("proxenet_pki_{}", Uuid::new_v4()));
        Self {
            ca_cert: root.join("ca.crt"),
            ca_key: root.join("ca.key"),
            leaf_key: root.join("leaf.key"),
            certs_dir: root.join("certs"),
            root,
        }
    }

    pub fn generate() -> anyhow::Result<Self> {
        let pki = Self::empty();
        CertificateAuthority::bootstrap(&pki.ca_cert, &pki.ca_key, &pki.leaf_key)?;
        Ok(pki)
    }

    pub fn open(&self) -> anyhow::Result<CertificateAuthority> {
        CertificateAuthority::open(&self.ca_cert, &self.ca_key, &self.leaf_key, &self.certs_dir)
    }
}

impl Drop for TestPki {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Config that never splits TLS, so no CA material is needed.
pub fn plain_config() -> Config {
    let mut config = Config::default();
    config.tls.intercept = false;
    config.hooks.dir = std::env::temp_dir().join(format!("proxenet_nohooks_{}", Uuid::new_v4()));
    config
}

pub fn plain_runtime() -> anyhow::Result<ProxyRuntime> {
    ProxyRuntime::new(plain_config(), EngineSet::new(), None)
}

/// Unique scratch directory for hook files, removed on drop.
pub struct TempDir(pub PathBuf);

impl TempDir {
    pub fn new(prefix: &str) -> anyhow::Result<Self> {
        let dir = std::env::temp_dir().join(format!("{}_{}", prefix, Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(Self(dir))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

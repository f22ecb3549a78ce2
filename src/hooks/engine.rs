// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Language engines that turn hook files into runnable programs.

use super::hook::{HookProgram, Language};
use crate::error::HookError;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runtime for one hook language.
pub trait HookEngine: Send + Sync {
    fn language(&self) -> Language;

    /// Bring the language runtime up before any hook is loaded.
    fn initialize(&self) -> Result<(), HookError> {
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<Box<dyn HookProgram>, HookError>;

    /// Release the language runtime once every hook has left.
    fn teardown(&self) {}
}

/// The engines available to a registry, at most one per language.
#[derive(Clone, Default)]
pub struct EngineSet {
    engines: Vec<Arc<dyn HookEngine>>,
}

impl EngineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engines bundled with the proxy.
    pub fn bundled() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(super::shell::ShellEngine::default()));
        set
    }

    /// Add an engine, replacing any previous engine for the same language.
    pub fn register(&mut self, engine: Arc<dyn HookEngine>) {
        let language = engine.language();
        self.engines.retain(|e| e.language() != language);
        self.engines.push(engine);
    }

    pub fn get(&self, language: Language) -> Option<&Arc<dyn HookEngine>> {
        self.engines.iter().find(|e| e.language() == language)
    }

    pub fn languages(&self) -> Vec<Language> {
        self.engines.iter().map(|e| e.language()).collect()
    }

    pub fn initialize_all(&self) {
        for engine in &self.engines {
            if let Err(e) = engine.initialize() {
                warn!(language = %engine.language(), error = %e, "engine failed to initialize");
            }
        }
    }

    pub fn teardown_all(&self) {
        for engine in &self.engines {
            debug!(language = %engine.language(), "tearing down engine");
            engine.teardown();
        }
    }
}

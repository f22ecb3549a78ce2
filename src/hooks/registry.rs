// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Hook registry: the ordered set of loaded hooks.

use super::engine::EngineSet;
use super::hook::{Hook, HookFileName, HookProgram, Language};
use crate::error::HookError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Snapshot of one hook for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInfo {
    pub id: usize,
    pub name: String,
    pub language: Language,
    pub priority: u8,
    pub active: bool,
    pub supported: bool,
}

impl fmt::Display for HookInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "|_ priority={:<3} id={:<3} type={:<10} name={:<20} ({}ACTIVE{})",
            self.priority,
            self.id,
            self.language.name(),
            self.name,
            if self.active { "" } else { "IN" },
            if self.supported { "" } else { ", unsupported" },
        )
    }
}

/// Hooks in traversal order: non-decreasing priority, arrival order within
/// a priority.
///
/// Structural changes take the write lock; the pipeline and toggles only
/// need the read lock.
pub struct HookRegistry {
    dir: PathBuf,
    engines: EngineSet,
    hooks: RwLock<Vec<Hook>>,
}

/// Insert before the first hook with a numerically greater priority.
fn insert_sorted(hooks: &mut Vec<Hook>, mut hook: Hook) -> usize {
    hook.id = hooks.len() + 1;
    let id = hook.id;
    let at = hooks
        .iter()
        .position(|h| h.priority() > hook.priority())
        .unwrap_or(hooks.len());
    hooks.insert(at, hook);
    id
}

impl HookRegistry {
    pub fn new(dir: impl Into<PathBuf>, engines: EngineSet) -> Self {
        Self {
            dir: dir.into(),
            engines,
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<Hook>>, HookError> {
        self.hooks.read().map_err(|_| HookError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Hook>>, HookError> {
        self.hooks.write().map_err(|_| HookError::Poisoned)
    }

    /// Register a hook built outside the hook directory. Returns its id.
    pub fn insert(&self, hook: Hook) -> Result<usize, HookError> {
        let mut hooks = self.write()?;
        let id = insert_sorted(&mut hooks, hook);
        debug!(id, "hook registered");
        Ok(id)
    }

    /// Register an in-process hook, running its `on_load` first.
    pub fn register(
        &self,
        name: &str,
        priority: u8,
        program: Box<dyn HookProgram>,
    ) -> Result<usize, HookError> {
        let hook = Hook::new(name, Language::Rust, priority, Some(program));
        call_on_load(&hook);
        self.insert(hook)
    }

    pub fn len(&self) -> usize {
        self.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Result<Vec<HookInfo>, HookError> {
        let hooks = self.read()?;
        Ok(hooks
            .iter()
            .map(|h| HookInfo {
                id: h.id(),
                name: h.name().to_string(),
                language: h.language(),
                priority: h.priority(),
                active: h.is_active(),
                supported: h.is_supported(),
            })
            .collect())
    }

    /// Flip the active flag of hook `id`, returning the new state.
    pub fn toggle(&self, id: usize) -> Result<bool, HookError> {
        let hooks = self.read()?;
        let hook = hooks
            .iter()
            .find(|h| h.id() == id)
            .ok_or(HookError::UnknownId(id))?;
        let active = hook.toggle();
        info!(id, name = hook.name(), active, "hook toggled");
        Ok(active)
    }

    fn build_hook(&self, path: &Path, parsed: HookFileName) -> Option<Hook> {
        let program = match self.engines.get(parsed.language) {
            Some(engine) => match engine.load(path) {
                Ok(program) => Some(program),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load hook");
                    return None;
                }
            },
            None => {
                warn!(
                    path = %path.display(),
                    language = %parsed.language,
                    "no engine for hook language, it will pass payloads through"
                );
                None
            }
        };
        let hook =
            Hook::new(parsed.name, parsed.language, parsed.priority, program).with_path(path);
        call_on_load(&hook);
        Some(hook)
    }

    /// Hook files in the directory, sorted by file name.
    fn scan(&self) -> Result<Vec<(PathBuf, HookFileName)>, HookError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| HookError::Scan {
            dir: self.dir.display().to_string(),
            source,
        })?;
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match HookFileName::parse(file_name) {
                Some(parsed) => found.push((path.clone(), parsed)),
                None => debug!(file = file_name, "skipping non-hook file"),
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    fn load_scanned(&self, hooks: &mut Vec<Hook>) -> Result<usize, HookError> {
        let mut added = 0;
        for (path, parsed) in self.scan()? {
            if hooks.iter().any(|h| h.path() == Some(path.as_path())) {
                continue;
            }
            if let Some(hook) = self.build_hook(&path, parsed) {
                let id = insert_sorted(hooks, hook);
                info!(id, path = %path.display(), "hook loaded");
                added += 1;
            }
        }
        Ok(added)
    }

    /// Load every hook file in the directory that is not loaded yet.
    pub fn load_all(&self) -> Result<usize, HookError> {
        self.engines.initialize_all();
        let mut hooks = self.write()?;
        self.load_scanned(&mut hooks)
    }

    /// Load one file from the hook directory by file name.
    pub fn load_file(&self, file_name: &str) -> Result<usize, HookError> {
        if file_name.contains('/') {
            return Err(HookError::InvalidName(file_name.to_string()));
        }
        let parsed = HookFileName::parse(file_name)
            .ok_or_else(|| HookError::InvalidName(file_name.to_string()))?;
        let path = self.dir.join(file_name);
        if !path.is_file() {
            return Err(HookError::Io {
                name: file_name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such hook file"),
            });
        }
        let mut hooks = self.write()?;
        if hooks.iter().any(|h| h.path() == Some(path.as_path())) {
            return Err(HookError::AlreadyLoaded(file_name.to_string()));
        }
        let hook = self
            .build_hook(&path, parsed)
            .ok_or_else(|| HookError::InvalidName(file_name.to_string()))?;
        let id = insert_sorted(&mut hooks, hook);
        info!(id, path = %path.display(), "hook loaded");
        Ok(id)
    }

    /// Every hook file in the directory with whether it is currently loaded.
    pub fn available(&self) -> Result<Vec<(String, bool)>, HookError> {
        let scanned = self.scan()?;
        let hooks = self.read()?;
        Ok(scanned
            .into_iter()
            .map(|(path, _)| {
                let loaded = hooks.iter().any(|h| h.path() == Some(path.as_path()));
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (name, loaded)
            })
            .collect())
    }

    /// Rebuild the registry from the hook directory.
    ///
    /// `is_idle` runs with the write lock held; if it returns false nothing
    /// is changed and `HookError::Busy` is returned.
    pub fn reload_if<F>(&self, is_idle: F) -> Result<usize, HookError>
    where
        F: FnOnce() -> bool,
    {
        let mut hooks = self.write()?;
        if !is_idle() {
            return Err(HookError::Busy);
        }
        for hook in hooks.iter() {
            call_on_leave(hook);
        }
        hooks.clear();
        self.engines.teardown_all();
        self.engines.initialize_all();
        let loaded = self.load_scanned(&mut hooks)?;
        info!(loaded, dir = %self.dir.display(), "hooks reloaded");
        Ok(loaded)
    }

    /// Unload every hook and release the language runtimes.
    pub fn shutdown(&self) {
        if let Ok(mut hooks) = self.write() {
            for hook in hooks.iter() {
                call_on_leave(hook);
            }
            hooks.clear();
        }
        self.engines.teardown_all();
    }
}

fn call_on_load(hook: &Hook) {
    if let Some(program) = hook.program.as_deref()
        && let Err(e) = program.on_load()
    {
        warn!(name = hook.name(), error = %e, "onload failed, hook disabled");
        hook.set_active(false);
    }
}

fn call_on_leave(hook: &Hook) {
    if let Some(program) = hook.program.as_deref()
        && let Err(e) = program.on_leave()
    {
        warn!(name = hook.name(), error = %e, "onleave failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::native::FnHook;
    use crate::hooks::hook::HookOutput;
    use crate::test_helpers::TempDir;

    fn passthrough() -> Box<dyn HookProgram> {
        Box::new(FnHook::new(|_, _, _| Ok(HookOutput::Unchanged)))
    }

    fn order(registry: &HookRegistry) -> Vec<(u8, String)> {
        registry
            .list()
            .expect("list")
            .into_iter()
            .map(|h| (h.priority, h.name))
            .collect()
    }

    #[test]
    fn stable_priority_insertion() -> Result<(), HookError> {
        let registry = HookRegistry::new("/nonexistent", EngineSet::new());
        registry.register("nine", 9, passthrough())?;
        registry.register("three-a", 3, passthrough())?;
        registry.register("three-b", 3, passthrough())?;
        registry.register("one", 1, passthrough())?;

        assert_eq!(
            order(&registry),
            vec![
                (1, "one".to_string()),
                (3, "three-a".to_string()),
                (3, "three-b".to_string()),
                (9, "nine".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn ids_follow_arrival_order() -> Result<(), HookError> {
        let registry = HookRegistry::new("/nonexistent", EngineSet::new());
        assert_eq!(registry.register("late", 5, passthrough())?, 1);
        assert_eq!(registry.register("early", 2, passthrough())?, 2);
        let ids: Vec<usize> = registry.list()?.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![2, 1]);
        Ok(())
    }

    #[test]
    fn toggle_unknown_id_is_an_error() -> Result<(), HookError> {
        let registry = HookRegistry::new("/nonexistent", EngineSet::new());
        let id = registry.register("h", 1, passthrough())?;
        assert!(!registry.toggle(id)?);
        assert!(registry.toggle(id)?);
        assert!(matches!(registry.toggle(99), Err(HookError::UnknownId(99))));
        Ok(())
    }

    #[test]
    fn load_all_scans_directory_and_marks_unsupported() -> anyhow::Result<()> {
        let dir = TempDir::new("proxenet_hooks")?;
        std::fs::write(dir.path().join("2second.sh"), "cat >/dev/null\n")?;
        std::fs::write(dir.path().join("1first.py"), "def proxenet_request_hook(): pass\n")?;
        std::fs::write(dir.path().join("notes.txt"), "ignored")?;

        let registry = HookRegistry::new(dir.path(), EngineSet::bundled());
        assert_eq!(registry.load_all()?, 2);

        let hooks = registry.list()?;
        assert_eq!(hooks.len(), 2);
        assert_eq!(hooks[0].name, "first");
        assert!(!hooks[0].supported);
        assert_eq!(hooks[1].name, "second");
        assert!(hooks[1].supported);

        // nothing new to load the second time
        assert_eq!(registry.load_all()?, 0);
        Ok(())
    }

    #[test]
    fn load_file_and_available() -> anyhow::Result<()> {
        let dir = TempDir::new("proxenet_hooks")?;
        std::fs::write(dir.path().join("1a.sh"), "")?;
        std::fs::write(dir.path().join("2b.sh"), "")?;
        let registry = HookRegistry::new(dir.path(), EngineSet::bundled());

        registry.load_file("2b.sh")?;
        assert!(matches!(registry.load_file("2b.sh"), Err(HookError::AlreadyLoaded(_))));
        assert!(matches!(registry.load_file("../x.sh"), Err(HookError::InvalidName(_))));
        assert!(registry.load_file("3missing.sh").is_err());

        let available = registry.available()?;
        assert_eq!(
            available,
            vec![("1a.sh".to_string(), false), ("2b.sh".to_string(), true)]
        );
        Ok(())
    }

    #[test]
    fn reload_refused_while_busy() -> anyhow::Result<()> {
        let dir = TempDir::new("proxenet_hooks")?;
        std::fs::write(dir.path().join("1a.sh"), "")?;
        let registry = HookRegistry::new(dir.path(), EngineSet::bundled());
        registry.load_all()?;
        std::fs::write(dir.path().join("2b.sh"), "")?;

        assert!(matches!(registry.reload_if(|| false), Err(HookError::Busy)));
        assert_eq!(order(&registry), vec![(1, "a".to_string())]);

        assert_eq!(registry.reload_if(|| true)?, 2);
        assert_eq!(
            order(&registry),
            vec![(1, "a".to_string()), (2, "b".to_string())]
        );
        Ok(())
    }

    #[test]
    fn reload_drops_removed_files_and_resets_toggles() -> anyhow::Result<()> {
        let dir = TempDir::new("proxenet_hooks")?;
        std::fs::write(dir.path().join("1a.sh"), "")?;
        std::fs::write(dir.path().join("2b.sh"), "")?;
        let registry = HookRegistry::new(dir.path(), EngineSet::bundled());
        registry.load_all()?;
        registry.toggle(1)?;
        std::fs::remove_file(dir.path().join("2b.sh"))?;

        registry.reload_if(|| true)?;
        let hooks = registry.list()?;
        assert_eq!(hooks.len(), 1);
        assert!(hooks[0].active);
        Ok(())
    }

    #[test]
    fn info_line_mentions_state() {
        let info = HookInfo {
            id: 2,
            name: "AddHeader".to_string(),
            language: Language::Python,
            priority: 1,
            active: false,
            supported: true,
        };
        let line = info.to_string();
        assert!(line.starts_with("|_ priority=1   id=2   type=Python"));
        assert!(line.ends_with("(INACTIVE)"));
    }
}

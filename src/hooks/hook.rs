// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use crate::error::HookError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Priority given to hook files whose name has no leading digit.
pub const DEFAULT_PRIORITY: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// Result of a single hook invocation.
///
/// `Unchanged` means the input buffer is passed on as-is, with no copy.
#[derive(Debug, PartialEq, Eq)]
pub enum HookOutput {
    Unchanged,
    Owned(Vec<u8>),
}

/// Language or binary format a hook file is written in, chosen by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    Ruby,
    Perl,
    Lua,
    Tcl,
    Java,
    Native,
    Shell,
    /// Hooks registered in-process through the library API
    Rust,
}

impl Language {
    pub const ALL: [Language; 9] = [
        Language::Python,
        Language::Ruby,
        Language::Perl,
        Language::Lua,
        Language::Tcl,
        Language::Java,
        Language::Native,
        Language::Shell,
        Language::Rust,
    ];

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "py" => Some(Language::Python),
            "rb" => Some(Language::Ruby),
            "pl" => Some(Language::Perl),
            "lua" => Some(Language::Lua),
            "tcl" => Some(Language::Tcl),
            "class" => Some(Language::Java),
            "so" => Some(Language::Native),
            "sh" => Some(Language::Shell),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::Ruby => "Ruby",
            Language::Perl => "Perl",
            Language::Lua => "Lua",
            Language::Tcl => "Tcl",
            Language::Java => "Java",
            Language::Native => "C",
            Language::Shell => "Shell",
            Language::Rust => "Rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Entry points of one loaded hook, provided by its language engine.
///
/// `invoke` may be called from many session threads at once.
pub trait HookProgram: Send + Sync {
    fn on_load(&self) -> Result<(), HookError> {
        Ok(())
    }

    fn invoke(
        &self,
        direction: Direction,
        transaction_id: u64,
        payload: &[u8],
    ) -> Result<HookOutput, HookError>;

    fn on_leave(&self) -> Result<(), HookError> {
        Ok(())
    }
}

/// Hook file name split into its parts: `<priority><name>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFileName {
    pub priority: u8,
    pub name: String,
    pub language: Language,
}

impl HookFileName {
    /// Returns `None` for names with an unknown extension or an empty stem.
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, ext) = file_name.rsplit_once('.')?;
        let language = Language::from_extension(ext)?;
        let (priority, name) = match stem.as_bytes().first() {
            Some(d @ b'1'..=b'9') => (d - b'0', &stem[1..]),
            _ => (DEFAULT_PRIORITY, stem),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self {
            priority,
            name: name.to_string(),
            language,
        })
    }
}

/// A registered transformation unit.
///
/// A hook without a program belongs to a language with no engine available;
/// the pipeline logs it and passes payloads through.
pub struct Hook {
    pub(crate) id: usize,
    name: String,
    path: Option<PathBuf>,
    language: Language,
    priority: u8,
    active: AtomicBool,
    pub(crate) program: Option<Box<dyn HookProgram>>,
}

impl Hook {
    pub fn new(
        name: impl Into<String>,
        language: Language,
        priority: u8,
        program: Option<Box<dyn HookProgram>>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            path: None,
            language,
            priority: priority.clamp(1, 9),
            active: AtomicBool::new(true),
            program,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Flip the active flag, returning the new state.
    pub fn toggle(&self) -> bool {
        !self.active.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_supported(&self) -> bool {
        self.program.is_some()
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("language", &self.language)
            .field("priority", &self.priority)
            .field("active", &self.is_active())
            .field("supported", &self.is_supported())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1AddHeader.py", Some((1, "AddHeader", Language::Python)))]
    #[case("9log.rb", Some((9, "log", Language::Ruby)))]
    #[case("strip.sh", Some((DEFAULT_PRIORITY, "strip", Language::Shell)))]
    #[case("0zero.sh", Some((DEFAULT_PRIORITY, "0zero", Language::Shell)))]
    #[case("3native.so", Some((3, "native", Language::Native)))]
    #[case("5.sh", None)]
    #[case("notes.txt", None)]
    #[case("README", None)]
    fn parses_hook_file_names(
        #[case] file: &str,
        #[case] expected: Option<(u8, &str, Language)>,
    ) {
        let got = HookFileName::parse(file);
        let expected = expected.map(|(priority, name, language)| HookFileName {
            priority,
            name: name.to_string(),
            language,
        });
        assert_eq!(got, expected);
    }

    #[test]
    fn toggle_flips_and_reports_state() {
        let hook = Hook::new("h", Language::Rust, 1, None);
        assert!(hook.is_active());
        assert!(!hook.toggle());
        assert!(!hook.is_active());
        assert!(hook.toggle());
        assert!(hook.is_active());
    }

    #[test]
    fn priority_is_clamped_to_range() {
        assert_eq!(Hook::new("low", Language::Rust, 0, None).priority(), 1);
        assert_eq!(Hook::new("high", Language::Rust, 42, None).priority(), 9);
    }
}

// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Ordered transformation hooks applied to every request and response.
//!
//! Hook files live in one directory and are named `<priority><name>.<ext>`,
//! priority 1 running first. The extension picks the language engine.

pub mod engine;
pub mod hook;
pub mod native;
pub mod pipeline;
pub mod registry;
pub mod shell;

pub use engine::{EngineSet, HookEngine};
pub use hook::{Direction, Hook, HookOutput, HookProgram, Language};
pub use native::FnHook;
pub use registry::{HookInfo, HookRegistry};

//! Module loader.
//!
//! A module is a descriptor of command, hook, capability and mode
//! registrations plus optional init/deinit callbacks. Loading is atomic:
//! any conflict rolls back every partial registration in reverse order
//! and the load fails. Unloading undoes everything automatically.
//!
//! Descriptors are compiled in; the reactor loads them between commands,
//! so no module handler is ever on the stack during its own unload.

pub mod cap_typing;
pub mod chm_no_nick_change;
pub mod umode_bot;

use crate::caps::CapNamespace;
use crate::commands::{CommandEntry, CommandTable};
use crate::hooks::{HookBus, HookFn, HookSubId};
use crate::modes::{ChannelModeKind, ChannelModeTable, UserModeTable};
use crate::state::ServerState;
use thiserror::Error;

/// Context handed to module init/deinit.
pub struct ModuleCtx<'a> {
    pub state: &'a mut ServerState,
    pub hooks: &'a mut HookBus,
    pub commands: &'a mut CommandTable,
}

pub type InitFn = fn(&mut ModuleCtx<'_>) -> Result<(), String>;
pub type DeinitFn = fn(&mut ModuleCtx<'_>);

pub struct CapSpec {
    pub name: &'static str,
    pub value: Option<&'static str>,
    /// Tag keys gated behind this capability.
    pub gates_tags: &'static [&'static str],
}

pub struct ChannelModeSpec {
    pub letter: char,
    pub kind: ChannelModeKind,
    pub oper_only: bool,
}

pub struct UserModeSpec {
    pub letter: char,
    pub restricted: bool,
}

/// Everything a module wants registered.
pub struct ModuleDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub init: Option<InitFn>,
    pub deinit: Option<DeinitFn>,
    pub commands: Vec<CommandEntry>,
    pub hooks: Vec<(&'static str, HookFn)>,
    pub caps: Vec<CapSpec>,
    pub cmodes: Vec<ChannelModeSpec>,
    pub umodes: Vec<UserModeSpec>,
}

impl ModuleDescriptor {
    pub fn new(name: &'static str, description: &'static str) -> Self {
        ModuleDescriptor {
            name,
            description,
            init: None,
            deinit: None,
            commands: Vec::new(),
            hooks: Vec::new(),
            caps: Vec::new(),
            cmodes: Vec::new(),
            umodes: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {module}: {reason}")]
    Conflict { module: String, reason: String },
    #[error("module {module} init failed: {reason}")]
    InitFailed { module: String, reason: String },
    #[error("module {0} is already loaded")]
    AlreadyLoaded(String),
    #[error("module {0} is not loaded")]
    NotLoaded(String),
}

/// Inverse operations, undone in reverse registration order.
enum UndoOp {
    Command(String),
    Hook(HookSubId),
    Cap { name: String, tags: Vec<String> },
    ChannelMode(char),
    UserMode(char),
}

struct LoadedModule {
    name: &'static str,
    deinit: Option<DeinitFn>,
    undo: Vec<UndoOp>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    loaded: Vec<LoadedModule>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|m| m.name == name)
    }

    pub fn loaded_names(&self) -> Vec<&'static str> {
        self.loaded.iter().map(|m| m.name).collect()
    }

    /// Load a module: apply every registration, then run init. On any
    /// failure the partial registrations are rolled back and the error
    /// returned.
    pub fn load(
        &mut self,
        descriptor: ModuleDescriptor,
        state: &mut ServerState,
        hooks: &mut HookBus,
        commands: &mut CommandTable,
    ) -> Result<(), ModuleError> {
        if self.is_loaded(descriptor.name) {
            return Err(ModuleError::AlreadyLoaded(descriptor.name.to_string()));
        }

        let ModuleDescriptor {
            name,
            description,
            init,
            deinit,
            commands: command_regs,
            hooks: hook_regs,
            caps,
            cmodes,
            umodes,
        } = descriptor;

        let mut undo: Vec<UndoOp> = Vec::new();
        let mut fail: Option<String> = None;

        for entry in command_regs {
            let verb = entry.verb.to_ascii_uppercase();
            match commands.register(entry) {
                Ok(()) => undo.push(UndoOp::Command(verb)),
                Err(e) => {
                    fail = Some(e.to_string());
                    break;
                }
            }
        }
        if fail.is_none() {
            for spec in caps {
                match state.caps.register(CapNamespace::Client, spec.name, spec.value) {
                    Ok(index) => {
                        let mut tags = Vec::new();
                        for tag in spec.gates_tags {
                            state.caps.gate_tag(tag, index);
                            tags.push(tag.to_string());
                        }
                        undo.push(UndoOp::Cap {
                            name: spec.name.to_string(),
                            tags,
                        });
                    }
                    Err(e) => {
                        fail = Some(e.to_string());
                        break;
                    }
                }
            }
        }
        if fail.is_none() {
            for spec in cmodes {
                match state.cmodes.register(spec.letter, spec.kind, spec.oper_only) {
                    Ok(()) => undo.push(UndoOp::ChannelMode(spec.letter)),
                    Err(e) => {
                        fail = Some(e.to_string());
                        break;
                    }
                }
            }
        }
        if fail.is_none() {
            for spec in umodes {
                match state.umodes.register(spec.letter, spec.restricted) {
                    Ok(_) => undo.push(UndoOp::UserMode(spec.letter)),
                    Err(e) => {
                        fail = Some(e.to_string());
                        break;
                    }
                }
            }
        }
        if fail.is_none() {
            for (key, callback) in hook_regs {
                undo.push(UndoOp::Hook(hooks.register(key, callback)));
            }
        }

        if fail.is_none() {
            if let Some(init) = init {
                let mut ctx = ModuleCtx {
                    state,
                    hooks,
                    commands,
                };
                if let Err(reason) = init(&mut ctx) {
                    fail = Some(reason);
                }
            }
        }

        if let Some(reason) = fail {
            Self::rollback(undo, state, hooks, commands);
            return Err(ModuleError::Conflict {
                module: name.to_string(),
                reason,
            });
        }

        tracing::info!(module = name, description, "module loaded");
        self.loaded.push(LoadedModule { name, deinit, undo });
        Ok(())
    }

    /// Unload: run deinit, then undo registrations in reverse order.
    pub fn unload(
        &mut self,
        name: &str,
        state: &mut ServerState,
        hooks: &mut HookBus,
        commands: &mut CommandTable,
    ) -> Result<(), ModuleError> {
        let idx = self
            .loaded
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| ModuleError::NotLoaded(name.to_string()))?;
        let module = self.loaded.remove(idx);

        if let Some(deinit) = module.deinit {
            let mut ctx = ModuleCtx {
                state,
                hooks,
                commands,
            };
            deinit(&mut ctx);
        }
        Self::rollback(module.undo, state, hooks, commands);
        tracing::info!(module = name, "module unloaded");
        Ok(())
    }

    fn rollback(
        undo: Vec<UndoOp>,
        state: &mut ServerState,
        hooks: &mut HookBus,
        commands: &mut CommandTable,
    ) {
        for op in undo.into_iter().rev() {
            match op {
                UndoOp::Command(verb) => {
                    commands.unregister(&verb);
                }
                UndoOp::Hook(id) => {
                    hooks.unregister(id);
                }
                UndoOp::Cap { name, tags } => {
                    for tag in tags {
                        state.caps.ungate_tag(&tag);
                    }
                    state.caps.unregister(&name);
                }
                UndoOp::ChannelMode(letter) => {
                    state.cmodes.unregister(letter);
                }
                UndoOp::UserMode(letter) => {
                    state.umodes.unregister(letter);
                }
            }
        }
    }
}

/// The modules shipped with the core.
pub fn builtin() -> Vec<ModuleDescriptor> {
    vec![
        chm_no_nick_change::descriptor(),
        umode_bot::descriptor(),
        cap_typing::descriptor(),
    ]
}

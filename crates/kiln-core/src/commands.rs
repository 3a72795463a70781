use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::preset::Capability;

/// Commands the orchestrator itself provides. They always win over preset
/// commands of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinCommand {
    Run,
    Watch,
    Test,
    Tasks,
}

impl BuiltinCommand {
    pub const ALL: [BuiltinCommand; 4] = [Self::Run, Self::Watch, Self::Test, Self::Tasks];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Watch => "watch",
            Self::Test => "test",
            Self::Tasks => "tasks",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Run => "Run a task once (default: 'default')",
            Self::Watch => "Build every bundle and rebuild on change",
            Self::Test => "Run the test suite through the configured test runner",
            Self::Tasks => "List every registered task",
        }
    }
}

impl Display for BuiltinCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuiltinCommand {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == value)
            .ok_or_else(|| Error::UnknownCommand(value.to_string()))
    }
}

/// A command contributed by a preset.
#[async_trait]
pub trait CommandHandler: Send + Sync + std::fmt::Debug {
    async fn run(&self, ctx: &BuildContext, args: &[String]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum CommandAction {
    Builtin(BuiltinCommand),
    Preset(Arc<dyn CommandHandler>),
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: String,
    pub description: String,
    /// The preset providing the command, `None` for builtins.
    pub owner: Option<String>,
    pub action: CommandAction,
}

/// Named commands in registration order; a later registration replaces an
/// earlier one in place.
#[derive(Debug, Default)]
pub struct CommandTable {
    entries: Vec<CommandSpec>,
    contributor: Option<String>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, description: &str, handler: Arc<dyn CommandHandler>) {
        self.insert(CommandSpec {
            name: name.to_string(),
            description: description.to_string(),
            owner: self.contributor.clone(),
            action: CommandAction::Preset(handler),
        });
    }

    fn insert(&mut self, spec: CommandSpec) {
        match self.entries.iter_mut().find(|e| e.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.entries.push(spec),
        }
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Like [`CommandTable::get`], failing with `unknown command '<name>'`.
    pub fn lookup(&self, name: &str) -> Result<&CommandSpec> {
        self.get(name)
            .ok_or_else(|| Error::UnknownCommand(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandSpec> {
        self.entries.iter()
    }
}

/// Merges the commands of every preset in load order, then the builtins.
#[instrument(skip_all)]
pub fn collect_commands(ctx: &BuildContext) -> CommandTable {
    let mut table = CommandTable::new();
    for preset in ctx.registry().implementations(&Capability::Commands) {
        table.contributor = Some(preset.name().to_string());
        preset.commands(ctx, &mut table);
    }
    table.contributor = None;

    for builtin in BuiltinCommand::ALL {
        if let Some(shadowed) = table.get(builtin.as_str()).and_then(|c| c.owner.clone()) {
            debug!(
                command = builtin.as_str(),
                preset = %shadowed,
                "builtin shadows preset command"
            );
        }
        table.insert(CommandSpec {
            name: builtin.as_str().to_string(),
            description: builtin.description().to_string(),
            owner: None,
            action: CommandAction::Builtin(builtin),
        });
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl CommandHandler for Noop {
        async fn run(&self, _ctx: &BuildContext, _args: &[String]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn parses_builtin_names() {
        assert_eq!("watch".parse::<BuiltinCommand>().unwrap(), BuiltinCommand::Watch);
        let err = "lint".parse::<BuiltinCommand>().unwrap_err();
        assert_eq!(err.to_string(), "unknown command 'lint'");
    }

    #[test]
    fn later_registration_replaces_in_place() {
        let mut table = CommandTable::new();
        table.contributor = Some("eslint".to_string());
        table.add("jsLint", "Lint JavaScript", Arc::new(Noop));
        table.add("cssLint", "Lint CSS", Arc::new(Noop));
        table.contributor = Some("custom".to_string());
        table.add("jsLint", "Lint JavaScript strictly", Arc::new(Noop));

        let names: Vec<_> = table.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["jsLint", "cssLint"]);
        let lint = table.lookup("jsLint").unwrap();
        assert_eq!(lint.owner.as_deref(), Some("custom"));
        assert!(table.lookup("missing").is_err());
    }
}

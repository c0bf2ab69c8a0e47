//! Command modes and the mode registry.
//!
//! A device CLI is modelled as a tree of named modes: the root is the mode a
//! fresh login lands in, every other mode is entered from its parent with an
//! enter command and left with an exit command. The [`ModeRegistry`] is built
//! once, validated to be a single-rooted tree, and then shared read-only
//! (usually behind an `Arc`) by every session that talks to that device type.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, ModeEntryFailure};
use crate::session::{ActionMap, Session, last_line};

/// Index of a mode inside its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModeId(usize);

impl ModeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A prompt that may show up while entering a mode, and the reply to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PromptAction {
    pub pattern: String,
    pub reply: String,
}

/// Declarative description of one mode, as written in templates or JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct ModeDefinition {
    /// Unique mode name.
    pub name: String,
    /// Regex matching this mode's prompt at the end of the output.
    pub prompt: String,
    /// Name of the parent mode; `None` only for the root.
    #[serde(default)]
    pub parent: Option<String>,
    /// Command sent in the parent mode to enter this mode.
    #[serde(default)]
    pub enter_command: String,
    /// Command sent in this mode to return to the parent.
    #[serde(default)]
    pub exit_command: String,
    /// Intermediate prompts answered while entering (confirmations, passwords).
    #[serde(default)]
    pub enter_action_map: Vec<PromptAction>,
    /// Commands sent the first time this process enters the mode.
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// Commands re-sent whenever a session is freshly bound to this mode.
    #[serde(default)]
    pub enter_actions: Vec<String>,
}

impl ModeDefinition {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn enter(mut self, command: impl Into<String>) -> Self {
        self.enter_command = command.into();
        self
    }

    pub fn exit(mut self, command: impl Into<String>) -> Self {
        self.exit_command = command.into();
        self
    }

    pub fn action(mut self, pattern: impl Into<String>, reply: impl Into<String>) -> Self {
        self.enter_action_map.push(PromptAction {
            pattern: pattern.into(),
            reply: reply.into(),
        });
        self
    }

    pub fn setup(mut self, command: impl Into<String>) -> Self {
        self.setup_commands.push(command.into());
        self
    }

    pub fn enter_action(mut self, command: impl Into<String>) -> Self {
        self.enter_actions.push(command.into());
        self
    }
}

/// One registered CLI mode.
#[derive(Debug)]
pub struct CommandMode {
    name: String,
    prompt: Regex,
    parent: Option<ModeId>,
    depth: usize,
    enter_command: String,
    exit_command: String,
    enter_action_map: ActionMap,
    setup_commands: Vec<String>,
    enter_actions: Vec<String>,
    /// Set once this process has run the setup commands for the mode.
    visited: AtomicBool,
}

impl CommandMode {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prompt(&self) -> &str {
        self.prompt.as_str()
    }

    pub fn prompt_regex(&self) -> &Regex {
        &self.prompt
    }

    pub fn parent(&self) -> Option<ModeId> {
        self.parent
    }

    /// Distance from the root; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn enter_command(&self) -> &str {
        &self.enter_command
    }

    pub fn exit_command(&self) -> &str {
        &self.exit_command
    }

    pub fn setup_commands(&self) -> &[String] {
        &self.setup_commands
    }

    pub fn visited(&self) -> bool {
        self.visited.load(Ordering::Acquire)
    }

    fn mark_visited(&self) {
        self.visited.store(true, Ordering::Release);
    }

    fn action_map(&self) -> Option<&ActionMap> {
        (!self.enter_action_map.is_empty()).then_some(&self.enter_action_map)
    }

    fn check_prompt(&self, output: &str) -> Result<(), CliError> {
        let line = last_line(output);
        if self.prompt.is_match(line) {
            return Ok(());
        }
        Err(CliError::ModeEntryFailed {
            mode: self.name.clone(),
            reason: ModeEntryFailure::UnexpectedPrompt(line.to_string()),
        })
    }
}

/// Immutable tree of all modes known for one device type.
#[derive(Debug)]
pub struct ModeRegistry {
    modes: Vec<CommandMode>,
    by_name: HashMap<String, ModeId>,
    root: ModeId,
    prompts_pattern: String,
}

impl ModeRegistry {
    /// Validates `definitions` and builds the tree.
    ///
    /// Fails unless there is exactly one root, every parent exists, names are
    /// unique, every non-root mode has enter and exit commands, and following
    /// parents from any mode reaches the root.
    pub fn new(definitions: Vec<ModeDefinition>) -> Result<Self, CliError> {
        if definitions.is_empty() {
            return Err(CliError::InvalidModeTree("no modes defined".to_string()));
        }

        let mut by_name = HashMap::new();
        for (index, def) in definitions.iter().enumerate() {
            if by_name.insert(def.name.clone(), ModeId(index)).is_some() {
                return Err(CliError::InvalidModeTree(format!(
                    "duplicate mode '{}'",
                    def.name
                )));
            }
        }

        let roots = definitions
            .iter()
            .enumerate()
            .filter(|(_, def)| def.parent.is_none())
            .map(|(index, _)| ModeId(index))
            .collect::<Vec<_>>();
        let root = match roots.as_slice() {
            [root] => *root,
            [] => {
                return Err(CliError::InvalidModeTree(
                    "no root mode (every mode has a parent)".to_string(),
                ));
            }
            _ => {
                let names = roots
                    .iter()
                    .map(|id| definitions[id.0].name.as_str())
                    .collect::<Vec<_>>();
                return Err(CliError::InvalidModeTree(format!(
                    "multiple root modes: {}",
                    names.join(", ")
                )));
            }
        };

        let mut parents = Vec::with_capacity(definitions.len());
        for def in &definitions {
            let parent = match def.parent.as_deref() {
                None => None,
                Some(name) => Some(*by_name.get(name).ok_or_else(|| {
                    CliError::InvalidModeTree(format!(
                        "mode '{}' has unknown parent '{}'",
                        def.name, name
                    ))
                })?),
            };
            if parent.is_some() && (def.enter_command.is_empty() || def.exit_command.is_empty())
            {
                return Err(CliError::InvalidModeTree(format!(
                    "mode '{}' needs both enter and exit commands",
                    def.name
                )));
            }
            parents.push(parent);
        }

        // Walking up must reach the root within `len` hops, otherwise a cycle
        // keeps the mode disconnected from the root.
        let mut depths = Vec::with_capacity(definitions.len());
        for (index, def) in definitions.iter().enumerate() {
            let mut depth = 0;
            let mut current = ModeId(index);
            while let Some(parent) = parents[current.0] {
                depth += 1;
                if depth > definitions.len() {
                    return Err(CliError::InvalidModeTree(format!(
                        "mode '{}' is part of a parent cycle",
                        def.name
                    )));
                }
                current = parent;
            }
            debug_assert_eq!(current, root);
            depths.push(depth);
        }

        let mut modes = Vec::with_capacity(definitions.len());
        for (index, def) in definitions.into_iter().enumerate() {
            let prompt = Regex::new(&def.prompt).map_err(|source| CliError::InvalidPattern {
                pattern: def.prompt.clone(),
                source,
            })?;
            let mut enter_action_map = ActionMap::new();
            for action in &def.enter_action_map {
                enter_action_map = enter_action_map.on(&action.pattern, action.reply.clone())?;
            }
            modes.push(CommandMode {
                name: def.name,
                prompt,
                parent: parents[index],
                depth: depths[index],
                enter_command: def.enter_command,
                exit_command: def.exit_command,
                enter_action_map,
                setup_commands: def.setup_commands,
                enter_actions: def.enter_actions,
                visited: AtomicBool::new(false),
            });
        }

        let mut seen = HashSet::new();
        let prompts_pattern = modes
            .iter()
            .map(|m| m.prompt())
            .filter(|p| seen.insert(*p))
            .map(|p| format!("(?:{p})"))
            .collect::<Vec<_>>()
            .join("|");

        Ok(Self {
            modes,
            by_name,
            root,
            prompts_pattern,
        })
    }

    /// Builds a registry from a JSON array of [`ModeDefinition`]s.
    pub fn from_json(json: &str) -> Result<Self, CliError> {
        let definitions: Vec<ModeDefinition> = serde_json::from_str(json)?;
        Self::new(definitions)
    }

    pub fn root(&self) -> ModeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Looks a mode up by id.
    ///
    /// Panics if `id` was issued by a different registry.
    pub fn mode(&self, id: ModeId) -> &CommandMode {
        &self.modes[id.0]
    }

    /// Looks a mode up by id, `None` if `id` is out of this registry's range.
    pub fn get(&self, id: ModeId) -> Option<&CommandMode> {
        self.modes.get(id.0)
    }

    pub fn id(&self, name: &str) -> Result<ModeId, CliError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| CliError::UnknownMode(name.to_string()))
    }

    pub fn name(&self, id: ModeId) -> &str {
        self.mode(id).name()
    }

    /// All modes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (ModeId, &CommandMode)> {
        self.modes
            .iter()
            .enumerate()
            .map(|(index, mode)| (ModeId(index), mode))
    }

    /// `id` followed by its ancestors, ending with the root.
    pub fn ancestors(&self, id: ModeId) -> Vec<ModeId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.mode(current).parent {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Alternation of every distinct prompt, matching any registered mode.
    pub fn prompts_pattern(&self) -> &str {
        &self.prompts_pattern
    }

    /// Prompt patterns registered by more than one mode, with the mode names.
    ///
    /// Such modes cannot be told apart by probing, so routing from them relies
    /// on the probe tie-break.
    pub fn ambiguous_prompts(&self) -> Vec<(String, Vec<String>)> {
        let mut groups: HashMap<&str, Vec<String>> = HashMap::new();
        for mode in &self.modes {
            groups
                .entry(mode.prompt())
                .or_default()
                .push(mode.name.clone());
        }
        let mut ambiguous = groups
            .into_iter()
            .filter(|(_, names)| names.len() > 1)
            .map(|(pattern, names)| (pattern.to_string(), names))
            .collect::<Vec<_>>();
        ambiguous.sort();
        ambiguous
    }

    /// Enters `id` from its parent.
    ///
    /// Sends the enter command and waits for the mode prompt, answering the
    /// enter action map on the way. The first successful entry in this
    /// process also runs the setup commands; a failure leaves the mode
    /// unvisited so the next entry retries them.
    pub fn step_up<S: Session + ?Sized>(&self, id: ModeId, session: &mut S) -> Result<(), CliError> {
        let mode = self.mode(id);
        self.enter(mode, session)?;
        if !mode.visited() {
            self.run_setup(mode, session)?;
            mode.mark_visited();
        }
        Ok(())
    }

    /// Leaves `id` for its parent.
    pub fn step_down<S: Session + ?Sized>(
        &self,
        id: ModeId,
        session: &mut S,
    ) -> Result<(), CliError> {
        let mode = self.mode(id);
        let parent = mode
            .parent
            .map(|parent| self.mode(parent))
            .ok_or_else(|| CliError::NoExitCommand(mode.name.clone()))?;
        debug!("Leaving mode {} for {}", mode.name, parent.name);
        let output = session
            .send_and_expect(&mode.exit_command, parent.prompt(), None, None)
            .map_err(|err| CliError::mode_entry(&parent.name, err))?;
        parent.check_prompt(&output)
    }

    /// Re-sends the mode's enter actions. Safe to repeat.
    pub fn enter_actions<S: Session + ?Sized>(
        &self,
        id: ModeId,
        session: &mut S,
    ) -> Result<(), CliError> {
        let mode = self.mode(id);
        for command in &mode.enter_actions {
            trace!("Enter action for {}: {}", mode.name, command);
            session.send_and_expect(command, mode.prompt(), None, None)?;
        }
        Ok(())
    }

    /// Enters `id` and runs its setup commands regardless of the visited marker.
    pub(crate) fn prime<S: Session + ?Sized>(&self, id: ModeId, session: &mut S) -> Result<(), CliError> {
        let mode = self.mode(id);
        if mode.parent.is_some() {
            self.enter(mode, session)?;
        }
        self.run_setup(mode, session)?;
        mode.mark_visited();
        Ok(())
    }

    fn enter<S: Session + ?Sized>(&self, mode: &CommandMode, session: &mut S) -> Result<(), CliError> {
        debug!("Entering mode {}", mode.name);
        let output = session
            .send_and_expect(&mode.enter_command, mode.prompt(), mode.action_map(), None)
            .map_err(|err| CliError::mode_entry(&mode.name, err))?;
        mode.check_prompt(&output)
    }

    fn run_setup<S: Session + ?Sized>(
        &self,
        mode: &CommandMode,
        session: &mut S,
    ) -> Result<(), CliError> {
        for command in &mode.setup_commands {
            trace!("Setup command for {}: {}", mode.name, command);
            let output = session
                .send_and_expect(command, mode.prompt(), None, None)
                .map_err(|err| CliError::mode_entry(&mode.name, err))?;
            mode.check_prompt(&output)?;
        }
        Ok(())
    }
}

//! Command registration and text routing.
//!
//! Routing priority is fixed: a case-insensitive literal beats a
//! case-sensitive literal, which beats a regex pattern. Within a class the
//! earliest registration wins. Literals match as prefixes of the message
//! text; patterns may match anywhere in it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use super::middleware::{CommandHandler, HandlerDyn};

/// Errors from building commands or the routing index.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("command '{0}' has no triggers")]
    NoTriggers(String),

    #[error("command '{0}' has no handler")]
    MissingHandler(String),

    #[error("invalid trigger pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// One rule deciding whether a command handles a message.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Message text starts with `text`.
    Literal { text: String, case_sensitive: bool },
    /// `Regex` matches somewhere in the message text.
    Pattern(Regex),
}

impl Trigger {
    pub fn literal(text: impl Into<String>) -> Self {
        Trigger::Literal {
            text: text.into(),
            case_sensitive: false,
        }
    }

    pub fn literal_case_sensitive(text: impl Into<String>) -> Self {
        Trigger::Literal {
            text: text.into(),
            case_sensitive: true,
        }
    }

    pub fn pattern(pattern: &str) -> Result<Self, RouterError> {
        Regex::new(pattern)
            .map(Trigger::Pattern)
            .map_err(|source| RouterError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Literal { text, .. } => f.write_str(text),
            Trigger::Pattern(regex) => f.write_str(regex.as_str()),
        }
    }
}

/// A registered command. Immutable once built.
pub struct Command {
    name: String,
    triggers: Vec<Trigger>,
    whitelist: HashSet<String>,
    handler: Arc<dyn HandlerDyn>,
}

impl Command {
    pub fn builder(name: impl Into<String>) -> CommandBuilder {
        CommandBuilder {
            name: name.into(),
            literals: Vec::new(),
            triggers: Vec::new(),
            patterns: Vec::new(),
            whitelist: HashSet::new(),
            case_sensitive: false,
            handler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn whitelist(&self) -> &HashSet<String> {
        &self.whitelist
    }

    /// Whether `sender` may invoke this command. An empty whitelist allows everyone.
    pub fn allows(&self, sender: &str) -> bool {
        self.whitelist.is_empty() || self.whitelist.contains(sender)
    }

    pub(crate) fn handler(&self) -> Arc<dyn HandlerDyn> {
        self.handler.clone()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("whitelist", &self.whitelist)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Command`].
pub struct CommandBuilder {
    name: String,
    /// Plain-text triggers; their case sensitivity is decided at build time.
    literals: Vec<(usize, String)>,
    triggers: Vec<(usize, Trigger)>,
    patterns: Vec<(usize, String)>,
    whitelist: HashSet<String>,
    case_sensitive: bool,
    handler: Option<Arc<dyn HandlerDyn>>,
}

impl CommandBuilder {
    fn next_slot(&self) -> usize {
        self.literals.len() + self.triggers.len() + self.patterns.len()
    }

    /// Add a literal prefix trigger. Case sensitivity follows [`case_sensitive`](Self::case_sensitive).
    pub fn trigger(mut self, text: impl Into<String>) -> Self {
        let slot = self.next_slot();
        self.literals.push((slot, text.into()));
        self
    }

    /// Add a regex trigger, compiled at build time.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        let slot = self.next_slot();
        self.patterns.push((slot, pattern.into()));
        self
    }

    /// Add a fully specified trigger.
    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        let slot = self.next_slot();
        self.triggers.push((slot, trigger));
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }

    /// Restrict the command to these sender ids.
    pub fn whitelist<I, S>(mut self, senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist.extend(senders.into_iter().map(Into::into));
        self
    }

    pub fn handler<H: CommandHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Command, RouterError> {
        let Some(handler) = self.handler else {
            return Err(RouterError::MissingHandler(self.name));
        };

        let mut slotted: Vec<(usize, Trigger)> = self.triggers;
        for (slot, text) in self.literals {
            slotted.push((
                slot,
                Trigger::Literal {
                    text,
                    case_sensitive: self.case_sensitive,
                },
            ));
        }
        for (slot, pattern) in self.patterns {
            slotted.push((slot, Trigger::pattern(&pattern)?));
        }
        slotted.sort_by_key(|(slot, _)| *slot);

        let triggers: Vec<Trigger> = slotted.into_iter().map(|(_, trigger)| trigger).collect();
        if triggers.is_empty() {
            return Err(RouterError::NoTriggers(self.name));
        }

        Ok(Command {
            name: self.name,
            triggers,
            whitelist: self.whitelist,
            handler,
        })
    }
}

/// The command and trigger selected for a message.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub command: Arc<Command>,
    pub trigger: Trigger,
}

/// Literals of one case class compiled into a single anchored alternation.
/// Capture group `i + 1` corresponds to `entries[i]`.
#[derive(Debug)]
struct LiteralTable {
    regex: Regex,
    entries: Vec<(Arc<Command>, Trigger)>,
}

impl LiteralTable {
    fn build(entries: Vec<(Arc<Command>, Trigger)>, case_insensitive: bool) -> Result<Option<Self>, RouterError> {
        if entries.is_empty() {
            return Ok(None);
        }
        let alternation = entries
            .iter()
            .map(|(_, trigger)| format!("({})", regex::escape(&trigger.to_string())))
            .collect::<Vec<_>>()
            .join("|");
        let flags = if case_insensitive { "(?i)" } else { "" };
        let pattern = format!("{flags}^(?:{alternation})");
        let regex = Regex::new(&pattern).map_err(|source| RouterError::InvalidPattern { pattern, source })?;
        Ok(Some(Self { regex, entries }))
    }

    fn find(&self, text: &str) -> Option<RouteMatch> {
        let captures = self.regex.captures(text)?;
        let index = (1..captures.len()).find(|group| captures.get(*group).is_some())? - 1;
        let (command, trigger) = self.entries.get(index)?;
        Some(RouteMatch {
            command: command.clone(),
            trigger: trigger.clone(),
        })
    }
}

/// Registry of commands plus the compiled routing index.
#[derive(Debug, Default)]
pub struct CommandRouter {
    commands: Vec<Arc<Command>>,
    case_insensitive: Option<LiteralTable>,
    case_sensitive: Option<LiteralTable>,
    patterns: Vec<(Arc<Command>, Trigger)>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command and rebuild the index.
    ///
    /// Returns `false` when this exact command (same `Arc`) is already registered.
    pub fn register(&mut self, command: Arc<Command>) -> Result<bool, RouterError> {
        if self.commands.iter().any(|existing| Arc::ptr_eq(existing, &command)) {
            return Ok(false);
        }
        self.commands.push(command);
        if let Err(e) = self.rebuild() {
            self.commands.pop();
            self.rebuild()?;
            return Err(e);
        }
        Ok(true)
    }

    pub fn commands(&self) -> &[Arc<Command>] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Select at most one command for `text`. Pure: no state changes.
    pub fn match_text(&self, text: &str) -> Option<RouteMatch> {
        if let Some(found) = self.case_insensitive.as_ref().and_then(|table| table.find(text)) {
            return Some(found);
        }
        if let Some(found) = self.case_sensitive.as_ref().and_then(|table| table.find(text)) {
            return Some(found);
        }
        self.patterns.iter().find_map(|(command, trigger)| match trigger {
            Trigger::Pattern(regex) if regex.is_match(text) => Some(RouteMatch {
                command: command.clone(),
                trigger: trigger.clone(),
            }),
            _ => None,
        })
    }

    fn rebuild(&mut self) -> Result<(), RouterError> {
        let mut insensitive = Vec::new();
        let mut sensitive = Vec::new();
        let mut patterns = Vec::new();

        for command in &self.commands {
            for trigger in command.triggers() {
                let entry = (command.clone(), trigger.clone());
                match trigger {
                    Trigger::Literal { case_sensitive: false, .. } => insensitive.push(entry),
                    Trigger::Literal { case_sensitive: true, .. } => sensitive.push(entry),
                    Trigger::Pattern(_) => patterns.push(entry),
                }
            }
        }

        self.case_insensitive = LiteralTable::build(insensitive, true)?;
        self.case_sensitive = LiteralTable::build(sensitive, false)?;
        self.patterns = patterns;
        Ok(())
    }
}

//! Convention-based message classification.
//!
//! A [`Conventions`] value is an ordered list of [`ClassificationRule`]s.
//! [`Conventions::classify`] returns the category of the first matching rule
//! (or [`MessageCategory::Unclassified`]); [`Conventions::check`] additionally
//! rejects types that match both a command and an event rule.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::descriptor::{MessageCategory, MessageTypeDescriptor};

type Predicate = dyn Fn(&MessageTypeDescriptor) -> bool + Send + Sync;

// ---------------------------------------------------------------------------
// ClassificationRule
// ---------------------------------------------------------------------------

/// A predicate over message types paired with the category it yields.
#[derive(Clone)]
pub struct ClassificationRule {
    label: String,
    category: MessageCategory,
    predicate: Arc<Predicate>,
}

impl ClassificationRule {
    /// Creates a rule from an arbitrary predicate.
    pub fn new<F>(label: impl Into<String>, category: MessageCategory, predicate: F) -> Self
    where
        F: Fn(&MessageTypeDescriptor) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            category,
            predicate: Arc::new(predicate),
        }
    }

    /// Creates a rule matching the full type name against a regular expression.
    ///
    /// # Errors
    ///
    /// Returns the regex compilation error for an invalid pattern.
    pub fn pattern(category: MessageCategory, pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(pattern)?;
        Ok(Self::new(format!("pattern:{pattern}"), category, move |d| {
            regex.is_match(&d.full_name())
        }))
    }

    /// The reference namespace/name suffix rule.
    ///
    /// Matches when the namespace is present, starts with `root_prefix`, ends
    /// with `namespace_suffix`, and the short name ends with `name_suffix`.
    #[must_use]
    pub fn namespace_suffix(
        category: MessageCategory,
        root_prefix: &str,
        namespace_suffix: &str,
        name_suffix: &str,
    ) -> Self {
        let label = format!("{category}:{root_prefix}*{namespace_suffix}/*{name_suffix}");
        let root_prefix = root_prefix.to_owned();
        let namespace_suffix = namespace_suffix.to_owned();
        let name_suffix = name_suffix.to_owned();
        Self::new(label, category, move |d| {
            d.namespace().is_some_and(|ns| {
                ns.starts_with(&root_prefix) && ns.ends_with(&namespace_suffix)
            }) && d.name().ends_with(&name_suffix)
        })
    }

    /// Tests the rule against a descriptor.
    #[must_use]
    pub fn matches(&self, descriptor: &MessageTypeDescriptor) -> bool {
        (self.predicate)(descriptor)
    }

    /// The category this rule yields.
    #[must_use]
    pub fn category(&self) -> MessageCategory {
        self.category
    }

    /// Human-readable rule description.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("label", &self.label)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// A configured regex rule appended after the reference rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRuleSettings {
    /// Regular expression matched against the full type name.
    pub pattern: String,
    /// Category yielded on match. Must be `command` or `event`.
    pub category: MessageCategory,
}

/// Naming conventions that define commands and events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConventionSettings {
    /// Required namespace prefix for both commands and events. May be empty.
    #[serde(default)]
    pub namespace_root_prefix: String,
    #[serde(default = "defaults::command_namespace_suffix")]
    pub command_namespace_suffix: String,
    #[serde(default = "defaults::command_name_suffix")]
    pub command_name_suffix: String,
    #[serde(default = "defaults::event_namespace_suffix")]
    pub event_namespace_suffix: String,
    #[serde(default = "defaults::event_name_suffix")]
    pub event_name_suffix: String,
    /// Extra rules, evaluated after the command and event rules in this order.
    #[serde(default)]
    pub additional_rules: Vec<PatternRuleSettings>,
}

impl Default for ConventionSettings {
    fn default() -> Self {
        Self {
            namespace_root_prefix: String::new(),
            command_namespace_suffix: defaults::command_namespace_suffix(),
            command_name_suffix: defaults::command_name_suffix(),
            event_namespace_suffix: defaults::event_namespace_suffix(),
            event_name_suffix: defaults::event_name_suffix(),
            additional_rules: Vec::new(),
        }
    }
}

impl ConventionSettings {
    /// Settings with the given root prefix and the default suffixes.
    #[must_use]
    pub fn with_root_prefix(prefix: impl Into<String>) -> Self {
        Self {
            namespace_root_prefix: prefix.into(),
            ..Self::default()
        }
    }
}

mod defaults {
    pub fn command_namespace_suffix() -> String {
        "Commands".to_string()
    }

    pub fn command_name_suffix() -> String {
        "Command".to_string()
    }

    pub fn event_namespace_suffix() -> String {
        "Events".to_string()
    }

    pub fn event_name_suffix() -> String {
        "Event".to_string()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A message type matched both a command rule and an event rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message type `{full_name}` matches both command and event conventions")]
pub struct AmbiguousClassification {
    pub full_name: String,
}

/// Invalid convention settings.
#[derive(Debug, thiserror::Error)]
pub enum ConventionError {
    #[error("convention setting `{setting}` must not be empty")]
    EmptySetting { setting: &'static str },
    #[error("invalid classification pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("classification pattern `{pattern}` must yield command or event")]
    UnroutableCategory { pattern: String },
}

// ---------------------------------------------------------------------------
// Conventions
// ---------------------------------------------------------------------------

/// Ordered classification rules. First match wins.
#[derive(Debug, Clone, Default)]
pub struct Conventions {
    rules: Vec<ClassificationRule>,
}

impl Conventions {
    /// Wraps an explicit rule list. Order is preserved exactly.
    #[must_use]
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Builds the reference command and event rules followed by any
    /// configured pattern rules.
    ///
    /// # Errors
    ///
    /// Returns `ConventionError` for empty suffixes, invalid patterns, or a
    /// pattern rule yielding `unclassified`.
    pub fn from_settings(settings: &ConventionSettings) -> Result<Self, ConventionError> {
        for (setting, value) in [
            ("command_namespace_suffix", &settings.command_namespace_suffix),
            ("command_name_suffix", &settings.command_name_suffix),
            ("event_namespace_suffix", &settings.event_namespace_suffix),
            ("event_name_suffix", &settings.event_name_suffix),
        ] {
            if value.is_empty() {
                return Err(ConventionError::EmptySetting { setting });
            }
        }

        let mut rules = vec![
            ClassificationRule::namespace_suffix(
                MessageCategory::Command,
                &settings.namespace_root_prefix,
                &settings.command_namespace_suffix,
                &settings.command_name_suffix,
            ),
            ClassificationRule::namespace_suffix(
                MessageCategory::Event,
                &settings.namespace_root_prefix,
                &settings.event_namespace_suffix,
                &settings.event_name_suffix,
            ),
        ];

        for extra in &settings.additional_rules {
            if !extra.category.is_routable() {
                return Err(ConventionError::UnroutableCategory {
                    pattern: extra.pattern.clone(),
                });
            }
            let rule = ClassificationRule::pattern(extra.category, &extra.pattern).map_err(
                |source| ConventionError::InvalidPattern {
                    pattern: extra.pattern.clone(),
                    source,
                },
            )?;
            rules.push(rule);
        }

        tracing::debug!(rules = rules.len(), "conventions built");
        Ok(Self { rules })
    }

    /// The rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Returns the category of the first matching rule.
    ///
    /// Pure and total: never fails, never blocks.
    #[must_use]
    pub fn classify(&self, descriptor: &MessageTypeDescriptor) -> MessageCategory {
        self.rules
            .iter()
            .find(|rule| rule.matches(descriptor))
            .map_or(MessageCategory::Unclassified, ClassificationRule::category)
    }

    /// Classifies, rejecting descriptors that match both a command and an
    /// event rule.
    ///
    /// # Errors
    ///
    /// Returns `AmbiguousClassification` naming the descriptor's full name.
    pub fn check(
        &self,
        descriptor: &MessageTypeDescriptor,
    ) -> Result<MessageCategory, AmbiguousClassification> {
        let mut command = false;
        let mut event = false;
        for rule in self.rules.iter().filter(|rule| rule.matches(descriptor)) {
            match rule.category() {
                MessageCategory::Command => command = true,
                MessageCategory::Event => event = true,
                MessageCategory::Unclassified => {}
            }
        }

        if command && event {
            return Err(AmbiguousClassification {
                full_name: descriptor.full_name(),
            });
        }
        Ok(self.classify(descriptor))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

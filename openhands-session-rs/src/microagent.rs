//! Microagents: named units of domain knowledge.
//!
//! A repository microagent is always active for the session it belongs to.
//! Knowledge microagents activate when one of their trigger keywords shows up
//! in the user's text.

use crate::errors::MicroagentError;
use crate::events::MicroagentKnowledge;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub mod loader;

pub use loader::load_microagents_from_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicroagentScope {
    Repository,
    Knowledge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Microagent {
    pub name: String,
    pub scope: MicroagentScope,
    /// Keywords, matched case-insensitively. Empty for repository scope.
    pub triggers: Vec<String>,
    pub content: String,
}

impl Microagent {
    pub fn knowledge<I, S>(name: impl Into<String>, triggers: I, content: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            scope: MicroagentScope::Knowledge,
            triggers: triggers.into_iter().map(Into::into).collect(),
            content: content.into(),
        }
    }

    pub fn repository(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: MicroagentScope::Repository,
            triggers: Vec::new(),
            content: content.into(),
        }
    }

    /// Returns the first trigger (in declared order) contained in `text`.
    pub fn match_trigger(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.triggers
            .iter()
            .find(|trigger| {
                let trigger = trigger.trim();
                !trigger.is_empty() && text.contains(&trigger.to_lowercase())
            })
            .map(String::as_str)
    }
}

/// Immutable set of microagents available to one recall engine.
///
/// Extending the index produces a new value; an index is never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MicroagentIndex {
    repository: Option<Microagent>,
    knowledge: BTreeMap<String, Microagent>,
}

impl MicroagentIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds an index, dropping every microagent named in `disabled`.
    ///
    /// Fails if more than one repository microagent survives the filter.
    pub fn new<I>(microagents: I, disabled: &[String]) -> Result<Self, MicroagentError>
    where
        I: IntoIterator<Item = Microagent>,
    {
        let mut repository: Vec<Microagent> = Vec::new();
        let mut knowledge = BTreeMap::new();
        for agent in microagents {
            if disabled.iter().any(|d| d == &agent.name) {
                debug!(name = %agent.name, "Skipping disabled microagent");
                continue;
            }
            match agent.scope {
                MicroagentScope::Knowledge => {
                    repository.retain(|r| r.name != agent.name);
                    knowledge.insert(agent.name.clone(), agent);
                }
                MicroagentScope::Repository => {
                    knowledge.remove(&agent.name);
                    repository.retain(|r| r.name != agent.name);
                    repository.push(agent);
                }
            }
        }
        if repository.len() > 1 {
            return Err(MicroagentError::MultipleRepoMicroagents(
                repository.into_iter().map(|r| r.name).collect(),
            ));
        }
        Ok(Self {
            repository: repository.pop(),
            knowledge,
        })
    }

    /// Returns a new index with `workspace` layered over this one.
    ///
    /// Workspace entries win over same-named entries, and a workspace
    /// repository microagent supersedes the current one.
    pub fn merged(
        &self,
        workspace: Vec<Microagent>,
        disabled: &[String],
    ) -> Result<Self, MicroagentError> {
        let overlay = Self::new(workspace, disabled)?;
        let mut merged = self.clone();
        for (name, agent) in overlay.knowledge {
            if merged.repository.as_ref().is_some_and(|r| r.name == name) {
                merged.repository = None;
            }
            merged.knowledge.insert(name, agent);
        }
        if let Some(repo) = overlay.repository {
            merged.knowledge.remove(&repo.name);
            merged.repository = Some(repo);
        }
        Ok(merged)
    }

    pub fn repository(&self) -> Option<&Microagent> {
        self.repository.as_ref()
    }

    /// Content of the repository microagent, or an empty string.
    pub fn repo_instructions(&self) -> &str {
        self.repository
            .as_ref()
            .map(|r| r.content.as_str())
            .unwrap_or("")
    }

    pub fn knowledge(&self) -> impl Iterator<Item = &Microagent> {
        self.knowledge.values()
    }

    pub fn get(&self, name: &str) -> Option<&Microagent> {
        self.knowledge
            .get(name)
            .or_else(|| self.repository.as_ref().filter(|r| r.name == name))
    }

    pub fn len(&self) -> usize {
        self.knowledge.len() + usize::from(self.repository.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Knowledge microagents triggered by any of `fragments`, ordered by name.
    ///
    /// Each microagent appears at most once, with the trigger that matched the
    /// earliest fragment.
    pub fn match_knowledge(&self, fragments: &[&str]) -> Vec<MicroagentKnowledge> {
        self.knowledge
            .values()
            .filter_map(|agent| {
                let trigger = fragments.iter().find_map(|f| agent.match_trigger(f))?;
                debug!(name = %agent.name, trigger, "Microagent triggered");
                Some(MicroagentKnowledge {
                    name: agent.name.clone(),
                    trigger: trigger.to_string(),
                    content: agent.content.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> MicroagentIndex {
        MicroagentIndex::new(
            vec![
                Microagent::knowledge("py_tips", ["python"], "Use virtualenvs."),
                Microagent::knowledge("git_tips", ["git", "github"], "Rebase often."),
                Microagent::repository("repo", "Run make test."),
            ],
            &[],
        )
        .unwrap()
    }

    #[test]
    fn trigger_match_is_case_insensitive_substring() {
        let agent = Microagent::knowledge("py_tips", ["python"], "x");
        assert_eq!(agent.match_trigger("I love Python tooling"), Some("python"));
        assert_eq!(agent.match_trigger("cpython internals"), Some("python"));
        assert_eq!(agent.match_trigger("rust"), None);
    }

    #[test]
    fn blank_triggers_never_match() {
        let agent = Microagent::knowledge("blank", ["", "  "], "x");
        assert_eq!(agent.match_trigger("anything"), None);
    }

    #[test]
    fn overlapping_triggers_all_match() {
        let matches = index().match_knowledge(&["help me with python and git"]);
        let names: Vec<&str> = matches.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["git_tips", "py_tips"]);
        assert_eq!(matches[0].trigger, "git");
        assert_eq!(matches[1].trigger, "python");
        assert_eq!(matches[1].content, "Use virtualenvs.");
    }

    #[test]
    fn keyword_fragments_match_once_per_agent() {
        let matches = index().match_knowledge(&["github", "git"]);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].trigger, "git");
    }

    #[test]
    fn disabled_microagents_are_dropped() {
        let index = MicroagentIndex::new(
            vec![
                Microagent::knowledge("py_tips", ["python"], "x"),
                Microagent::repository("repo", "y"),
            ],
            &["py_tips".to_string()],
        )
        .unwrap();
        assert!(index.match_knowledge(&["python"]).is_empty());
        assert_eq!(index.repo_instructions(), "y");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn rejects_two_repository_microagents() {
        let err = MicroagentIndex::new(
            vec![
                Microagent::repository("a", "x"),
                Microagent::repository("b", "y"),
            ],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, MicroagentError::MultipleRepoMicroagents(names) if names.len() == 2));
    }

    #[test]
    fn workspace_entries_take_precedence() {
        let global = index();
        let merged = global
            .merged(
                vec![
                    Microagent::knowledge("py_tips", ["pytest"], "Workspace tips."),
                    Microagent::repository("workspace_repo", "Use cargo."),
                ],
                &[],
            )
            .unwrap();

        assert_eq!(merged.get("py_tips").unwrap().content, "Workspace tips.");
        assert_eq!(merged.repo_instructions(), "Use cargo.");
        assert_eq!(merged.repository().unwrap().name, "workspace_repo");
        assert!(merged.get("repo").is_none());
        // The original index is untouched.
        assert_eq!(global.get("py_tips").unwrap().content, "Use virtualenvs.");
        assert_eq!(global.repo_instructions(), "Run make test.");
    }

    #[test]
    fn empty_index() {
        let index = MicroagentIndex::empty();
        assert!(index.is_empty());
        assert_eq!(index.repo_instructions(), "");
        assert!(index.match_knowledge(&["python"]).is_empty());
    }
}

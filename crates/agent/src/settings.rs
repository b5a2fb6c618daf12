//! Process-wide runtime settings changed by local commands.
//!
//! Requests take a snapshot once at the start and never see a change made
//! while they stream. The only writers are local commands, which run
//! instead of a provider call.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeSettings {
    pub active_provider: String,
    /// Skill ids pinned in full
    pub active_skills: BTreeSet<String>,
}

impl RuntimeSettings {
    pub fn new(active_provider: impl Into<String>) -> Self {
        Self {
            active_provider: active_provider.into(),
            active_skills: BTreeSet::new(),
        }
    }
}

/// Shared handle to the current settings.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<RuntimeSettings>>,
}

impl SettingsHandle {
    pub fn new(initial: RuntimeSettings) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> RuntimeSettings {
        self.tx.borrow().clone()
    }

    /// Observe changes, e.g. to log them.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeSettings> {
        self.tx.subscribe()
    }

    pub fn set_provider(&self, name: impl Into<String>) {
        let name = name.into();
        self.tx.send_modify(|s| s.active_provider = name);
    }

    /// Returns false if the skill was already active.
    pub fn activate_skill(&self, id: &str) -> bool {
        self.tx.send_if_modified(|s| s.active_skills.insert(id.to_string()))
    }

    /// Returns false if the skill was not active.
    pub fn deactivate_skill(&self, id: &str) -> bool {
        self.tx.send_if_modified(|s| s.active_skills.remove(id))
    }
}

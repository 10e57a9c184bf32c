//! Shared value types used across scheduling, configuration, and snapshots.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique task identifier.
pub type TaskId = uuid::Uuid;

/// Generate a fresh task identifier.
#[must_use]
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4()
}

/// Task priority. Variants are declared lowest first so the derived `Ord`
/// ranks `Critical` highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Opportunistic work, admitted only when nothing else is waiting.
    Background,
    /// Low priority.
    Low,
    /// Default priority.
    #[default]
    Medium,
    /// High priority.
    High,
    /// Must run before anything else that is queued.
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Background => "background",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A resource dimension tracked by its own pool.
///
/// Serialized as a plain string (`"cpu"`, `"llm_call"`, ...) so it can be used
/// as a configuration map key. Unrecognized names become [`ResourceKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ResourceKind {
    /// CPU share.
    Cpu,
    /// Memory share.
    Memory,
    /// Disk I/O share.
    Disk,
    /// Network bandwidth share.
    Network,
    /// Generic external API call budget.
    ApiCall,
    /// LLM call budget.
    LlmCall,
    /// Headless browser sessions.
    BrowserSession,
    /// Any other named resource.
    Custom(String),
}

impl ResourceKind {
    /// The built-in kinds that get a pool by default.
    pub const BUILTIN: [Self; 7] = [
        Self::Cpu,
        Self::Memory,
        Self::Disk,
        Self::Network,
        Self::ApiCall,
        Self::LlmCall,
        Self::BrowserSession,
    ];

    /// Stable string name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::ApiCall => "api_call",
            Self::LlmCall => "llm_call",
            Self::BrowserSession => "browser_session",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ResourceKind {
    fn from(s: &str) -> Self {
        match s {
            "cpu" => Self::Cpu,
            "memory" => Self::Memory,
            "disk" => Self::Disk,
            "network" => Self::Network,
            "api_call" => Self::ApiCall,
            "llm_call" => Self::LlmCall,
            "browser_session" => Self::BrowserSession,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for ResourceKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

//! Consent prompts.
//!
//! A [`ConsentPrompt`] shows one question to the human and reports the
//! answer. It knows nothing about grants, tokens or deduplication; the
//! orchestrator decides when to ask and enforces the timeout.

mod linux;
mod macos;
mod windows;

pub use linux::LinuxPrompt;
pub use macos::MacosPrompt;
pub use windows::WindowsPrompt;

use async_trait::async_trait;
use policy::{ClientIdentity, ConsentDecision, EndpointRef};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const TITLE: &str = "Gatehouse Authorization";

/// What the human is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub client: ClientIdentity,
    pub endpoint: EndpointRef,
    pub description: String,
    pub permissions: Vec<String>,
    /// The dialog may give up on its own after this long.
    pub timeout: Duration,
}

impl PromptRequest {
    /// The question as shown in every native dialog.
    pub fn message(&self) -> String {
        let mut message = format!(
            "The application '{}' wants to access:\n\n{}",
            self.client.name(),
            self.endpoint
        );
        if !self.description.is_empty() {
            message.push_str(&format!(" ({})", self.description));
        }
        if !self.permissions.is_empty() {
            message.push_str(&format!("\n\nPermissions: {}", self.permissions.join(", ")));
        }
        message
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("no consent dialog available: {0}")]
    Unavailable(String),

    #[error("consent dialog failed: {0}")]
    Failed(String),
}

/// Shows a consent question to the human.
#[async_trait]
pub trait ConsentPrompt: Send + Sync {
    /// Ask once. `Ok(None)` means the dialog closed without an answer.
    ///
    /// The future may be dropped at any point when the request is resolved
    /// some other way; implementations must tear the dialog down on drop.
    async fn prompt_user(
        &self,
        request: &PromptRequest,
    ) -> Result<Option<ConsentDecision>, PromptError>;
}

/// The native dialog for the platform this binary was built for.
pub fn platform_prompt() -> Arc<dyn ConsentPrompt> {
    if cfg!(target_os = "macos") {
        Arc::new(MacosPrompt::new())
    } else if cfg!(target_os = "windows") {
        Arc::new(WindowsPrompt::new())
    } else {
        Arc::new(LinuxPrompt::new())
    }
}

fn spawn_error(program: &str, error: std::io::Error) -> PromptError {
    if error.kind() == std::io::ErrorKind::NotFound {
        PromptError::Unavailable(format!("{program} not found"))
    } else {
        PromptError::Failed(format!("failed to run {program}: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names_client_endpoint_and_permissions() {
        let request = PromptRequest {
            client: ClientIdentity::named("app-a"),
            endpoint: EndpointRef::new("demo", "/execute"),
            description: String::new(),
            permissions: vec!["execute:command".into(), "read:system".into()],
            timeout: Duration::from_secs(60),
        };
        assert_eq!(
            request.message(),
            "The application 'app-a' wants to access:\n\n/demo/execute\n\nPermissions: execute:command, read:system"
        );
    }

    #[test]
    fn missing_program_is_unavailable() {
        let error = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            spawn_error("zenity", error),
            PromptError::Unavailable(_)
        ));
    }
}

use super::{ConsentPrompt, PromptError, PromptRequest, TITLE, spawn_error};
use async_trait::async_trait;
use policy::ConsentDecision;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

/// `zenity --question`, falling back to `kdialog --yesno`.
///
/// Both offer only two buttons, so the answers are `AllowAlways` and `Deny`.
#[derive(Debug, Clone, Default)]
pub struct LinuxPrompt;

impl LinuxPrompt {
    pub fn new() -> Self {
        Self
    }

    fn zenity(request: &PromptRequest) -> Command {
        let mut cmd = Command::new("zenity");
        cmd.arg("--question")
            .arg("--no-markup")
            .arg(format!("--title={TITLE}"))
            .arg(format!("--text={}", request.message()))
            .arg("--ok-label=Allow")
            .arg("--cancel-label=Deny")
            .arg(format!("--timeout={}", request.timeout.as_secs().max(1)));
        cmd
    }

    fn kdialog(request: &PromptRequest) -> Command {
        let mut cmd = Command::new("kdialog");
        cmd.arg("--title")
            .arg(TITLE)
            .arg("--yesno")
            .arg(request.message())
            .arg("--yes-label")
            .arg("Allow")
            .arg("--no-label")
            .arg("Deny");
        cmd
    }
}

#[async_trait]
impl ConsentPrompt for LinuxPrompt {
    async fn prompt_user(
        &self,
        request: &PromptRequest,
    ) -> Result<Option<ConsentDecision>, PromptError> {
        match run(Self::zenity(request), "zenity").await {
            Ok(status) => return Ok(zenity_answer(status.code())),
            Err(PromptError::Unavailable(reason)) => {
                tracing::debug!(%reason, "falling back to kdialog");
            }
            Err(e) => return Err(e),
        }

        let status = run(Self::kdialog(request), "kdialog").await?;
        Ok(kdialog_answer(status.code()))
    }
}

async fn run(mut cmd: Command, program: &str) -> Result<ExitStatus, PromptError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| spawn_error(program, e))
}

fn zenity_answer(code: Option<i32>) -> Option<ConsentDecision> {
    match code {
        Some(0) => Some(ConsentDecision::AllowAlways),
        Some(1) => Some(ConsentDecision::Deny),
        // 5 is zenity's --timeout exit code; anything else is a closed or
        // crashed dialog.
        _ => None,
    }
}

fn kdialog_answer(code: Option<i32>) -> Option<ConsentDecision> {
    match code {
        Some(0) => Some(ConsentDecision::AllowAlways),
        Some(1) => Some(ConsentDecision::Deny),
        _ => None,
    }
}

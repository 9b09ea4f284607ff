use super::{ConsentPrompt, PromptError, PromptRequest, TITLE, spawn_error};
use async_trait::async_trait;
use policy::ConsentDecision;
use std::process::Stdio;
use tokio::process::Command;

const GAVE_UP: &str = "timeout";

/// `display dialog` through `osascript`.
#[derive(Debug, Clone, Default)]
pub struct MacosPrompt;

impl MacosPrompt {
    pub fn new() -> Self {
        Self
    }

    fn script(request: &PromptRequest) -> String {
        format!(
            r#"set theDialog to display dialog "{message}" buttons {{"Deny", "Allow Once", "Allow Always"}} default button "Deny" with title "{TITLE}" giving up after {seconds}
if gave up of theDialog then
    return "{GAVE_UP}"
end if
return button returned of theDialog"#,
            message = applescript_escape(&request.message()),
            seconds = request.timeout.as_secs().max(1),
        )
    }
}

#[async_trait]
impl ConsentPrompt for MacosPrompt {
    async fn prompt_user(
        &self,
        request: &PromptRequest,
    ) -> Result<Option<ConsentDecision>, PromptError> {
        let output = Command::new("osascript")
            .arg("-e")
            .arg(Self::script(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error("osascript", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PromptError::Failed(format!(
                "osascript exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_button(String::from_utf8_lossy(&output.stdout).trim()))
    }
}

fn parse_button(button: &str) -> Option<ConsentDecision> {
    match button {
        "Allow Always" => Some(ConsentDecision::AllowAlways),
        "Allow Once" => Some(ConsentDecision::AllowOnce),
        GAVE_UP => None,
        _ => Some(ConsentDecision::Deny),
    }
}

/// Client names are caller-controlled and end up inside a string literal.
fn applescript_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}

use super::{ConsentPrompt, PromptError, PromptRequest, TITLE, spawn_error};
use async_trait::async_trait;
use policy::ConsentDecision;
use std::process::Stdio;
use tokio::process::Command;

/// A WinForms message box through PowerShell.
///
/// Yes allows always, No allows once, Cancel denies.
#[derive(Debug, Clone, Default)]
pub struct WindowsPrompt;

impl WindowsPrompt {
    pub fn new() -> Self {
        Self
    }

    fn script(request: &PromptRequest) -> String {
        let message = format!(
            "{}\n\nYes: allow always. No: allow once. Cancel: deny.",
            request.message()
        );
        format!(
            "Add-Type -AssemblyName System.Windows.Forms\n\
             $result = [System.Windows.Forms.MessageBox]::Show('{}', '{TITLE}', \
             [System.Windows.Forms.MessageBoxButtons]::YesNoCancel, \
             [System.Windows.Forms.MessageBoxIcon]::Question)\n\
             Write-Output $result",
            powershell_quote(&message)
        )
    }
}

#[async_trait]
impl ConsentPrompt for WindowsPrompt {
    async fn prompt_user(
        &self,
        request: &PromptRequest,
    ) -> Result<Option<ConsentDecision>, PromptError> {
        let output = Command::new("powershell")
            .arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-Command")
            .arg(Self::script(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error("powershell", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PromptError::Failed(format!(
                "powershell exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(parse_result(String::from_utf8_lossy(&output.stdout).trim()))
    }
}

fn parse_result(result: &str) -> Option<ConsentDecision> {
    match result {
        "Yes" => Some(ConsentDecision::AllowAlways),
        "No" => Some(ConsentDecision::AllowOnce),
        "Cancel" => Some(ConsentDecision::Deny),
        _ => None,
    }
}

/// PowerShell closes a single-quoted string on `'` and on the typographic
/// single quotes; each is escaped by doubling it.
fn powershell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}') {
            quoted.push(c);
        }
        quoted.push(c);
    }
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::{ClientIdentity, EndpointRef};
    use std::time::Duration;

    #[test]
    fn maps_message_box_results() {
        assert_eq!(parse_result("Yes"), Some(ConsentDecision::AllowAlways));
        assert_eq!(parse_result("No"), Some(ConsentDecision::AllowOnce));
        assert_eq!(parse_result("Cancel"), Some(ConsentDecision::Deny));
        assert_eq!(parse_result(""), None);
    }

    #[test]
    fn quotes_client_names() {
        let request = PromptRequest {
            client: ClientIdentity::named("it's"),
            endpoint: EndpointRef::new("demo", "/execute"),
            description: String::new(),
            permissions: vec![],
            timeout: Duration::from_secs(60),
        };
        assert!(WindowsPrompt::script(&request).contains("'it''s'"));
    }

    #[test]
    fn quotes_typographic_quotes() {
        let request = PromptRequest {
            client: ClientIdentity::named("x\u{2019}); Start-Process calc; (\u{2018}"),
            endpoint: EndpointRef::new("demo", "/execute"),
            description: String::new(),
            permissions: vec![],
            timeout: Duration::from_secs(60),
        };
        let script = WindowsPrompt::script(&request);
        assert!(script.contains("x\u{2019}\u{2019}); Start-Process calc; (\u{2018}\u{2018}"));
        assert!(!script.contains("x\u{2019});"));
    }
}

//! Fake prompts for tests.

use crate::prompt::{ConsentPrompt, PromptError, PromptRequest};
use async_trait::async_trait;
use policy::ConsentDecision;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Never answers; the orchestrator's timeout or an operator answer resolves.
pub(crate) struct NeverPrompt;

#[async_trait]
impl ConsentPrompt for NeverPrompt {
    async fn prompt_user(
        &self,
        _request: &PromptRequest,
    ) -> Result<Option<ConsentDecision>, PromptError> {
        std::future::pending().await
    }
}

/// One scripted step per prompt shown.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Answer(ConsentDecision),
    /// Answer after a delay.
    AnswerAfter(Duration, ConsentDecision),
    Hang,
    Fail,
}

/// Plays back scripted answers and counts the prompts shown. Prompts past
/// the end of the script hang.
pub(crate) struct ScriptedPrompt {
    steps: Mutex<VecDeque<Step>>,
    shown: AtomicUsize,
    requests: Mutex<Vec<PromptRequest>>,
}

impl ScriptedPrompt {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            shown: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn answering(decision: ConsentDecision) -> Self {
        Self::new([Step::Answer(decision)])
    }

    pub(crate) fn shown(&self) -> usize {
        self.shown.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<PromptRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsentPrompt for ScriptedPrompt {
    async fn prompt_user(
        &self,
        request: &PromptRequest,
    ) -> Result<Option<ConsentDecision>, PromptError> {
        self.shown.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Hang);

        match step {
            Step::Answer(decision) => Ok(Some(decision)),
            Step::AnswerAfter(delay, decision) => {
                tokio::time::sleep(delay).await;
                Ok(Some(decision))
            }
            Step::Hang => std::future::pending().await,
            Step::Fail => Err(PromptError::Failed("scripted failure".into())),
        }
    }
}

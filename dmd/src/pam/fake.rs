//! A `fake-auth`-gated stand-in for `Authenticator`, driven by
//! `dmd-fixtures::ScriptedAuthDb` instead of the host PAM stack. Lets the
//! integration tests exercise the full prompt/respond/complete protocol
//! without root or a real user database.

use std::sync::Mutex;

use dmd_fixtures::{Outcome, ScriptedAuth, ScriptedAuthDb, Step};

use super::authenticator::{AuthBackend, AuthEvent, AuthOutcome, Message, MessageBatch};
use crate::error::Result;

pub struct FakeAuthenticator {
    script: Option<ScriptedAuth>,
    step: usize,
    completed: bool,
}

impl FakeAuthenticator {
    pub fn start(db: &Mutex<ScriptedAuthDb>, username: &str) -> FakeAuthenticator {
        let script = db
            .lock()
            .unwrap()
            .next_attempt(username)
            .unwrap_or_else(|| ScriptedAuthDb::unknown_user(username));
        FakeAuthenticator {
            script: Some(script),
            step: 0,
            completed: false,
        }
    }

    fn outcome(&self) -> AuthOutcome {
        match self.script.as_ref().map(|s| s.outcome) {
            Some(Outcome::Authenticated) => AuthOutcome::Authenticated,
            Some(Outcome::Denied) => AuthOutcome::Denied,
            Some(Outcome::AccountExpired) => AuthOutcome::AccountExpired,
            Some(Outcome::UnknownUser) => AuthOutcome::UnknownUser,
            Some(Outcome::SystemError) | None => AuthOutcome::SystemError,
        }
    }
}

#[async_trait::async_trait]
impl AuthBackend for FakeAuthenticator {
    async fn next_event(&mut self) -> Option<AuthEvent> {
        if self.completed {
            return None;
        }

        let steps = self.script.as_ref().map(|s| s.steps.len()).unwrap_or(0);
        if self.step >= steps {
            self.completed = true;
            return Some(AuthEvent::Complete(self.outcome()));
        }

        let step = self.script.as_ref().unwrap().steps[self.step].clone();
        let msg = match step {
            Step::Secret { text, .. } => Message::Secret(text),
            Step::Visible { text, .. } => Message::Visible(text),
            Step::Info(text) => Message::Info(text),
            Step::Error(text) => Message::Error(text),
        };
        Some(AuthEvent::Messages(MessageBatch(vec![msg])))
    }

    async fn respond(&mut self, answers: Vec<String>) -> Result<()> {
        let step = self.script.as_ref().unwrap().steps[self.step].clone();
        let expected = match &step {
            Step::Secret { expect, .. } | Step::Visible { expect, .. } => Some(expect.clone()),
            Step::Info(_) | Step::Error(_) => None,
        };

        if let Some(expected) = expected {
            if answers.first() != Some(&expected) {
                self.script = self.script.take().map(|s| ScriptedAuth {
                    outcome: Outcome::Denied,
                    ..s
                });
            }
        }
        self.step += 1;
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        self.completed = true;
        Ok(())
    }
}

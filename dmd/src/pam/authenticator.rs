//! Drives a PAM conversation on a dedicated OS thread so the async event
//! loop never blocks on `libpam`. The worker and the caller talk over two
//! channels: an events channel carrying prompt batches and the final
//! result, and a depth-1 responses channel carrying answers back. At most
//! one `messages` event is ever outstanding — `respond`/`cancel` is the
//! only thing that re-arms the worker.

use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use pam_sys::PamFlag;
use tokio::sync::mpsc;

use super::converse::Converse;
use super::session::PamSession;
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Visible(String),
    Secret(String),
    Info(String),
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageBatch(pub Vec<Message>);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    Denied,
    AccountExpired,
    NewTokenRequired,
    MaxTries,
    UnknownUser,
    Cancelled,
    SystemError,
}

pub enum AuthEvent {
    Messages(MessageBatch),
    Complete(AuthOutcome),
}

enum Response {
    Answers(Vec<String>),
    Cancel,
}

pub struct Authenticator {
    events_rx: mpsc::Receiver<AuthEvent>,
    responses_tx: mpsc::Sender<Response>,
    worker: Option<JoinHandle<()>>,
}

#[async_trait::async_trait]
pub trait AuthBackend: Send {
    async fn next_event(&mut self) -> Option<AuthEvent>;
    async fn respond(&mut self, answers: Vec<String>) -> Result<()>;
    async fn cancel(&mut self) -> Result<()>;
}

#[async_trait::async_trait]
impl AuthBackend for Authenticator {
    async fn next_event(&mut self) -> Option<AuthEvent> {
        Authenticator::next_event(self).await
    }

    async fn respond(&mut self, answers: Vec<String>) -> Result<()> {
        Authenticator::respond(self, answers).await
    }

    async fn cancel(&mut self) -> Result<()> {
        Authenticator::cancel(self).await
    }
}

impl Authenticator {
    pub fn start(service: &str, username: Option<&str>) -> Authenticator {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (responses_tx, responses_rx) = mpsc::channel(1);

        let service = service.to_string();
        let username = username.map(str::to_string);
        let worker_events_tx = events_tx.clone();
        let worker = thread::spawn(move || {
            worker_main(service, username, worker_events_tx, responses_rx);
        });

        Authenticator {
            events_rx,
            responses_tx,
            worker: Some(worker),
        }
    }

    /// Waits for the next prompt batch or the final outcome. `None` once
    /// the worker thread has exited without sending `Complete` (a panic
    /// inside the PAM call, treated as a system error by the caller).
    pub async fn next_event(&mut self) -> Option<AuthEvent> {
        self.events_rx.recv().await
    }

    pub async fn respond(&self, answers: Vec<String>) -> Result<()> {
        self.responses_tx
            .send(Response::Answers(answers))
            .await
            .map_err(|_| Error::AuthSystemError("authenticator worker is gone".into()))
    }

    pub async fn cancel(&self) -> Result<()> {
        self.responses_tx
            .send(Response::Cancel)
            .await
            .map_err(|_| Error::AuthSystemError("authenticator worker is gone".into()))
    }
}

impl Drop for Authenticator {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Bridges the `&self`-only `Converse` callback to the two async channels.
struct ChannelConverse {
    events_tx: mpsc::Sender<AuthEvent>,
    responses_rx: Mutex<mpsc::Receiver<Response>>,
}

impl ChannelConverse {
    fn ask(&self, msg: Message) -> Result<String, ()> {
        self.events_tx
            .blocking_send(AuthEvent::Messages(MessageBatch(vec![msg])))
            .map_err(|_| ())?;

        let mut rx = self.responses_rx.lock().unwrap();
        match rx.blocking_recv() {
            Some(Response::Answers(mut answers)) if !answers.is_empty() => {
                let answer = answers.remove(0);
                for leftover in answers.iter_mut() {
                    zero(leftover);
                }
                Ok(answer)
            }
            _ => Err(()),
        }
    }

    fn notify(&self, msg: Message) -> Result<(), ()> {
        self.events_tx
            .blocking_send(AuthEvent::Messages(MessageBatch(vec![msg])))
            .map_err(|_| ())
    }
}

impl Converse for ChannelConverse {
    fn prompt_echo(&self, msg: &str) -> Result<String, ()> {
        self.ask(Message::Visible(msg.to_string()))
    }

    fn prompt_blind(&self, msg: &str) -> Result<String, ()> {
        self.ask(Message::Secret(msg.to_string()))
    }

    fn info(&self, msg: &str) -> Result<(), ()> {
        self.notify(Message::Info(msg.to_string()))
    }

    fn error(&self, msg: &str) -> Result<(), ()> {
        self.notify(Message::Error(msg.to_string()))
    }
}

fn zero(s: &mut String) {
    unsafe {
        for b in s.as_bytes_mut() {
            *b = 0;
        }
    }
    s.clear();
}

fn worker_main(
    service: String,
    username: Option<String>,
    events_tx: mpsc::Sender<AuthEvent>,
    responses_rx: mpsc::Receiver<Response>,
) {
    let conv = ChannelConverse {
        events_tx: events_tx.clone(),
        responses_rx: Mutex::new(responses_rx),
    };

    let outcome = run(&service, username.as_deref(), conv);
    let _ = events_tx.blocking_send(AuthEvent::Complete(outcome));
}

fn run(service: &str, username: Option<&str>, conv: ChannelConverse) -> AuthOutcome {
    let username = match username {
        Some(u) => u.to_string(),
        None => {
            // No username yet — PAM will prompt for one via prompt_echo,
            // and we read it back off the session once started.
            String::new()
        }
    };

    let conv: std::pin::Pin<Box<dyn Converse + Send>> = Box::pin(conv);
    let mut pam = match PamSession::start(service, &username, conv) {
        Ok(p) => p,
        Err(_) => return AuthOutcome::SystemError,
    };

    if let Err(e) = pam.authenticate(PamFlag::NONE) {
        return classify(e);
    }
    if let Err(e) = pam.acct_mgmt(PamFlag::NONE) {
        return classify(e);
    }
    if let Err(e) = pam.setcred(PamFlag::ESTABLISH_CRED) {
        return classify(e);
    }

    AuthOutcome::Authenticated
}

fn classify(e: Error) -> AuthOutcome {
    match e {
        Error::AuthFailure(msg) if msg.contains("USER_UNKNOWN") => AuthOutcome::UnknownUser,
        Error::AuthFailure(msg) if msg.contains("ACCT_EXPIRED") => AuthOutcome::AccountExpired,
        Error::AuthFailure(msg) if msg.contains("NEW_AUTHTOK_REQD") => AuthOutcome::NewTokenRequired,
        Error::AuthFailure(msg) if msg.contains("MAXTRIES") => AuthOutcome::MaxTries,
        Error::AuthFailure(_) => AuthOutcome::Denied,
        _ => AuthOutcome::SystemError,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_overwrites_and_clears() {
        let mut s = String::from("secret");
        zero(&mut s);
        assert!(s.is_empty());
    }
}

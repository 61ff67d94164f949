//! Orchestration around the setuid guest-account helper script. The
//! helper itself is out of scope (§6 states its contract); this just
//! invokes it and tracks the transient account it hands back.

use tokio::process::Command;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct GuestState {
    pub username: String,
    pub helper_command: String,
}

impl GuestState {
    /// Runs `$script add`, parsing the printed username from stdout. Any
    /// non-zero exit aborts guest login with `spawn_error`.
    pub async fn provision(helper_command: &str) -> Result<GuestState> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!("{} add", helper_command))
            .output()
            .await
            .map_err(|e| Error::Spawn(format!("guest helper add: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Spawn(format!(
                "guest helper add exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let username = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if username.is_empty() {
            return Err(Error::Spawn("guest helper add printed no username".into()));
        }

        Ok(GuestState {
            username,
            helper_command: helper_command.to_string(),
        })
    }

    /// Runs `$script remove $username`. Best-effort: a failure here is
    /// logged, not propagated, since the session has already ended.
    pub async fn teardown(&self) {
        let result = Command::new("sh")
            .arg("-c")
            .arg(format!("{} remove {}", self.helper_command, self.username))
            .status()
            .await;

        match result {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::warn!(user = %self.username, %status, "guest helper remove failed");
            }
            Err(e) => {
                tracing::warn!(user = %self.username, error = %e, "failed to run guest helper remove");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn provision_parses_printed_username() {
        let state = GuestState::provision("echo guest-1234").await.unwrap();
        assert_eq!(state.username, "guest-1234");
    }

    #[tokio::test]
    async fn provision_rejects_nonzero_exit() {
        let err = GuestState::provision("false").await;
        assert!(err.is_err());
    }
}

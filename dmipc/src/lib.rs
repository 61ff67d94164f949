//! Wire protocol for the greeter IPC channel.
//!
//! Every message is `u32 length (BE) | u32 tag (BE) | body`, where `length`
//! counts the tag plus the body (i.e. everything after the length field
//! itself). Strings are `u32 length (BE) | utf-8 bytes`, booleans are `u32`
//! (0 or 1), and maps are `u32 count | (string key, string value) * count`.
//!
//! Tag IDs are part of the contract and must not change.

use std::collections::HashMap;

mod codec;
mod wire;

#[cfg(feature = "tokio-codec")]
mod tokio_codec;

pub use codec::{decode, encode, Frame};
#[cfg(feature = "tokio-codec")]
pub use tokio_codec::{read_message, write_message};

pub mod tag {
    pub const CONNECT: u32 = 1;
    pub const AUTHENTICATE: u32 = 2;
    pub const AUTHENTICATE_AS_GUEST: u32 = 3;
    pub const CONTINUE: u32 = 4;
    pub const START_SESSION: u32 = 5;
    pub const CANCEL: u32 = 6;
    pub const SET_LANGUAGE: u32 = 7;

    pub const CONNECTED: u32 = 101;
    pub const PROMPT: u32 = 103;
    pub const AUTH_COMPLETE: u32 = 104;
    pub const END_SESSION: u32 = 105;
    pub const SESSION_RESULT: u32 = 106;
    pub const IDLE: u32 = 107;
    pub const RESET: u32 = 108;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated frame: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("unknown message tag: {0}")]
    UnknownTag(u32),
    #[error("invalid utf-8 in protocol string")]
    InvalidUtf8,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptKind {
    Secret,
    Visible,
    Info,
    Error,
}

impl PromptKind {
    fn from_u32(v: u32) -> Result<PromptKind> {
        Ok(match v {
            0 => PromptKind::Secret,
            1 => PromptKind::Visible,
            2 => PromptKind::Info,
            3 => PromptKind::Error,
            _ => return Err(Error::Malformed("invalid prompt kind")),
        })
    }

    fn as_u32(self) -> u32 {
        match self {
            PromptKind::Secret => 0,
            PromptKind::Visible => 1,
            PromptKind::Info => 2,
            PromptKind::Error => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthResultCode {
    Authenticated,
    Denied,
    AccountExpired,
    NewTokenRequired,
    MaxTries,
    UnknownUser,
    Cancelled,
    SystemError,
}

impl AuthResultCode {
    fn from_u32(v: u32) -> Result<AuthResultCode> {
        use AuthResultCode::*;
        Ok(match v {
            0 => Authenticated,
            1 => Denied,
            2 => AccountExpired,
            3 => NewTokenRequired,
            4 => MaxTries,
            5 => UnknownUser,
            6 => Cancelled,
            7 => SystemError,
            _ => return Err(Error::Malformed("invalid auth result code")),
        })
    }

    fn as_u32(self) -> u32 {
        use AuthResultCode::*;
        match self {
            Authenticated => 0,
            Denied => 1,
            AccountExpired => 2,
            NewTokenRequired => 3,
            MaxTries => 4,
            UnknownUser => 5,
            Cancelled => 6,
            SystemError => 7,
        }
    }
}

/// Messages sent from the greeter to the daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToDaemon {
    Connect { api_version: u32 },
    Authenticate { username: Option<String> },
    AuthenticateAsGuest,
    Continue { responses: Vec<String> },
    Cancel,
    StartSession { session_key: Option<String> },
    SetLanguage { code: String },
}

/// Messages sent from the daemon to the greeter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToGreeter {
    Connected { hints: HashMap<String, String> },
    Prompt { kind: PromptKind, text: String },
    AuthComplete { result: AuthResultCode, username: Option<String> },
    EndSession,
    SessionResult { exit_code: i32 },
    Idle,
    Reset,
}

pub(crate) use wire::{Reader, Writer};

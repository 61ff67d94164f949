use crate::{tag, AuthResultCode, Error, PromptKind, Reader, Result, ToDaemon, ToGreeter, Writer};

/// Encode a full frame (`length | tag | body`) for any protocol message.
pub fn encode<M: Frame>(msg: &M) -> Vec<u8> {
    let mut body = Writer::new();
    let tag = msg.encode_body(&mut body);
    let body = body.into_bytes();

    let mut frame = Writer::new();
    frame.u32((body.len() + 4) as u32);
    frame.u32(tag);
    let mut out = frame.into_bytes();
    out.extend_from_slice(&body);
    out
}

/// Decode a message from a body slice (the bytes following `length | tag`
/// in a frame, i.e. NOT including the length or tag fields themselves).
pub fn decode<M: Frame>(tag: u32, body: &[u8]) -> Result<M> {
    M::decode_body(tag, body)
}

pub trait Frame: Sized {
    fn encode_body(&self, w: &mut Writer) -> u32;
    fn decode_body(tag: u32, body: &[u8]) -> Result<Self>;
}

impl Frame for ToDaemon {
    fn encode_body(&self, w: &mut Writer) -> u32 {
        match self {
            ToDaemon::Connect { api_version } => {
                w.u32(*api_version);
                tag::CONNECT
            }
            ToDaemon::Authenticate { username } => {
                w.opt_string(username);
                tag::AUTHENTICATE
            }
            ToDaemon::AuthenticateAsGuest => tag::AUTHENTICATE_AS_GUEST,
            ToDaemon::Continue { responses } => {
                w.strings(responses);
                tag::CONTINUE
            }
            ToDaemon::Cancel => tag::CANCEL,
            ToDaemon::StartSession { session_key } => {
                w.opt_string(session_key);
                tag::START_SESSION
            }
            ToDaemon::SetLanguage { code } => {
                w.string(code);
                tag::SET_LANGUAGE
            }
        }
    }

    fn decode_body(tag: u32, body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let msg = match tag {
            crate::tag::CONNECT => ToDaemon::Connect {
                api_version: r.u32()?,
            },
            crate::tag::AUTHENTICATE => ToDaemon::Authenticate {
                username: r.opt_string()?,
            },
            crate::tag::AUTHENTICATE_AS_GUEST => ToDaemon::AuthenticateAsGuest,
            crate::tag::CONTINUE => ToDaemon::Continue {
                responses: r.strings()?,
            },
            crate::tag::CANCEL => ToDaemon::Cancel,
            crate::tag::START_SESSION => ToDaemon::StartSession {
                session_key: r.opt_string()?,
            },
            crate::tag::SET_LANGUAGE => ToDaemon::SetLanguage { code: r.string()? },
            other => return Err(Error::UnknownTag(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

impl Frame for ToGreeter {
    fn encode_body(&self, w: &mut Writer) -> u32 {
        match self {
            ToGreeter::Connected { hints } => {
                w.map(hints);
                tag::CONNECTED
            }
            ToGreeter::Prompt { kind, text } => {
                w.u32(kind.as_u32());
                w.string(text);
                tag::PROMPT
            }
            ToGreeter::AuthComplete { result, username } => {
                w.u32(result.as_u32());
                w.opt_string(username);
                tag::AUTH_COMPLETE
            }
            ToGreeter::EndSession => tag::END_SESSION,
            ToGreeter::SessionResult { exit_code } => {
                w.u32(*exit_code as u32);
                tag::SESSION_RESULT
            }
            ToGreeter::Idle => tag::IDLE,
            ToGreeter::Reset => tag::RESET,
        }
    }

    fn decode_body(tag: u32, body: &[u8]) -> Result<Self> {
        let mut r = Reader::new(body);
        let msg = match tag {
            crate::tag::CONNECTED => ToGreeter::Connected { hints: r.map()? },
            crate::tag::PROMPT => {
                let kind = PromptKind::from_u32(r.u32()?)?;
                let text = r.string()?;
                ToGreeter::Prompt { kind, text }
            }
            crate::tag::AUTH_COMPLETE => {
                let result = AuthResultCode::from_u32(r.u32()?)?;
                let username = r.opt_string()?;
                ToGreeter::AuthComplete { result, username }
            }
            crate::tag::END_SESSION => ToGreeter::EndSession,
            crate::tag::SESSION_RESULT => ToGreeter::SessionResult {
                exit_code: r.u32()? as i32,
            },
            crate::tag::IDLE => ToGreeter::Idle,
            crate::tag::RESET => ToGreeter::Reset,
            other => return Err(Error::UnknownTag(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn split_frame(bytes: &[u8]) -> (u32, &[u8]) {
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let tag = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(len as usize, bytes.len() - 4);
        (tag, &bytes[8..])
    }

    #[test]
    fn round_trips_every_to_daemon_variant() {
        let msgs = vec![
            ToDaemon::Connect { api_version: 1 },
            ToDaemon::Authenticate {
                username: Some("alice".to_string()),
            },
            ToDaemon::Authenticate { username: None },
            ToDaemon::AuthenticateAsGuest,
            ToDaemon::Continue {
                responses: vec!["secret".to_string()],
            },
            ToDaemon::Cancel,
            ToDaemon::StartSession {
                session_key: Some("gnome".to_string()),
            },
            ToDaemon::SetLanguage {
                code: "en_US".to_string(),
            },
        ];
        for msg in msgs {
            let bytes = encode(&msg);
            let (tag, body) = split_frame(&bytes);
            let decoded: ToDaemon = decode(tag, body).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn round_trips_every_to_greeter_variant() {
        let mut hints = HashMap::new();
        hints.insert("default-session".to_string(), "gnome".to_string());
        let msgs = vec![
            ToGreeter::Connected { hints },
            ToGreeter::Prompt {
                kind: PromptKind::Secret,
                text: "Password:".to_string(),
            },
            ToGreeter::AuthComplete {
                result: AuthResultCode::Authenticated,
                username: Some("alice".to_string()),
            },
            ToGreeter::EndSession,
            ToGreeter::SessionResult { exit_code: -1 },
            ToGreeter::Idle,
            ToGreeter::Reset,
        ];
        for msg in msgs {
            let bytes = encode(&msg);
            let (tag, body) = split_frame(&bytes);
            let decoded: ToGreeter = decode(tag, body).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = decode::<ToDaemon>(999, &[]).unwrap_err();
        assert!(matches!(err, Error::UnknownTag(999)));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let msg = ToDaemon::SetLanguage {
            code: "en_US".to_string(),
        };
        let bytes = encode(&msg);
        let (tag, body) = split_frame(&bytes);
        let err = decode::<ToDaemon>(tag, &body[..body.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }
}

//! Remote control payload decoding
//!
//! Wire format on the control topic:
//! ```json
//! {"command": "open", "token": "<shared secret>"}
//! ```
//! A missing token still yields an intent; the auth gate rejects it.

use crate::domain::error::CommandError;
use crate::domain::types::{Action, Intent, Token};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ControlPayload {
    command: String,
    #[serde(default)]
    token: Option<String>,
}

/// Decode a control message into a remote intent
///
/// `Ok(None)` means well-formed JSON with an unknown command.
pub fn parse_control_message(payload: &[u8]) -> Result<Option<Intent>, CommandError> {
    let text = std::str::from_utf8(payload).map_err(|_| CommandError::InvalidUtf8)?;
    let message: ControlPayload = serde_json::from_str(text)?;

    let action = match message.command.trim().to_ascii_lowercase().as_str() {
        "open" => Action::Open,
        "close" => Action::Close,
        _ => return Ok(None),
    };

    Ok(Some(Intent::remote(action, message.token.map(Token::new))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Source;

    #[test]
    fn test_parse_open_with_token() {
        let intent = parse_control_message(br#"{"command":"open","token":"T"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(intent.action, Action::Open);
        assert_eq!(intent.source, Source::Remote);
        assert_eq!(intent.credential, Some(Token::new("T")));
    }

    #[test]
    fn test_parse_close_without_token() {
        let intent = parse_control_message(br#"{"command":"Close"}"#).unwrap().unwrap();
        assert_eq!(intent.action, Action::Close);
        assert!(intent.credential.is_none());
    }

    #[test]
    fn test_unknown_command_is_none() {
        assert!(parse_control_message(br#"{"command":"toggle","token":"T"}"#).unwrap().is_none());
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(parse_control_message(b"not json"), Err(CommandError::InvalidJson(_))));
        assert!(matches!(parse_control_message(br#"{"token":"T"}"#), Err(CommandError::InvalidJson(_))));
        assert!(matches!(parse_control_message(&[0xff, 0xfe]), Err(CommandError::InvalidUtf8)));
    }
}

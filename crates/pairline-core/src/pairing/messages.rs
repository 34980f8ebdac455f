//! Outbound side-channel messages and pairing-code formatting.

use crate::client::OutboundMessage;

pub const CREDENTIALS_FILE_NAME: &str = "creds.json";
pub const CREDENTIALS_MIME_TYPE: &str = "application/json";

pub const ADVISORY_TEXT: &str = "Do not share this file with anybody. \
Anyone holding it has full access to your account. \
If you did not request it, remove the linked device now.";

/// Document carrying the serialized credential blob.
pub fn credentials_document(data: Vec<u8>) -> OutboundMessage {
    OutboundMessage::Document {
        file_name: CREDENTIALS_FILE_NAME.to_string(),
        mime_type: CREDENTIALS_MIME_TYPE.to_string(),
        data,
    }
}

pub fn advisory_message() -> OutboundMessage {
    OutboundMessage::Text(ADVISORY_TEXT.to_string())
}

/// Group a raw code in fours: `ABCD1234` → `ABCD-1234`.
///
/// Separators already present are dropped first, so formatting is idempotent.
pub fn format_pairing_code(raw: &str) -> String {
    let chars: Vec<char> = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    chars
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_in_groups_of_four() {
        assert_eq!(format_pairing_code("ABCD1234"), "ABCD-1234");
        assert_eq!(format_pairing_code("ABCDE"), "ABCD-E");
    }

    #[test]
    fn formatting_is_idempotent() {
        assert_eq!(format_pairing_code("ABCD-1234"), "ABCD-1234");
        assert_eq!(format_pairing_code(" AB CD 12 34 "), "ABCD-1234");
    }

    #[test]
    fn empty_code_stays_empty() {
        assert_eq!(format_pairing_code(""), "");
    }

    #[test]
    fn document_is_json_named_creds() {
        match credentials_document(b"{}".to_vec()) {
            OutboundMessage::Document {
                file_name,
                mime_type,
                data,
            } => {
                assert_eq!(file_name, "creds.json");
                assert_eq!(mime_type, "application/json");
                assert_eq!(data, b"{}");
            }
            other => panic!("Expected document, got {:?}", other),
        }
    }

    #[test]
    fn advisory_warns_against_sharing() {
        match advisory_message() {
            OutboundMessage::Text(text) => assert!(text.contains("Do not share")),
            other => panic!("Expected text, got {:?}", other),
        }
    }
}

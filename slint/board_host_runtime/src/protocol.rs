use crate::board::{InputState, OutputState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Read};

pub const SIM_TO_HOST_LINE_CAP: usize = 1_048_576;

/// Messages the panel sends to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum PanelMessage {
    #[serde(rename = "updateInput")]
    UpdateInput { arguments: InputState },

    #[serde(rename = "terminal-input")]
    TerminalInput { value: String },

    #[serde(rename = "onInfo")]
    Info {
        #[serde(default)]
        value: Option<String>,
    },

    #[serde(rename = "onError")]
    Error {
        #[serde(default)]
        value: Option<String>,
    },
}

/// Messages the host posts to the panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "boardUpdate")]
    BoardUpdate { body: OutputState },

    #[serde(rename = "terminal-output")]
    TerminalOutput { value: String },
}

pub fn update_input_message(arguments: InputState) -> PanelMessage {
    PanelMessage::UpdateInput { arguments }
}

pub fn encode_panel_message(message: &PanelMessage) -> io::Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(json_error)
}

pub fn decode_host_message(payload: &[u8]) -> io::Result<HostMessage> {
    serde_json::from_slice(payload).map_err(json_error)
}

/// Splits one simulator document into the messages the panel consumes: the
/// raw terminal echo always, and a board update when the document carries
/// LED or seven-segment fields.
pub fn host_messages_for_document(document: &Value) -> Vec<HostMessage> {
    let mut messages = vec![HostMessage::TerminalOutput {
        value: document.to_string(),
    }];

    let carries_board =
        document.get("ledArray").is_some() || document.get("sevenSegment").is_some();
    if !carries_board {
        return messages;
    }

    match serde_json::from_value::<OutputState>(document.clone()) {
        Ok(body) => messages.push(HostMessage::BoardUpdate { body }),
        Err(err) => log::warn!("simulator board fields do not decode: {err}"),
    }

    messages
}

/// Reads newline-delimited JSON documents until EOF.
///
/// Each line is handed to `on_document` as parsed or as the parse error, so
/// the caller decides whether a malformed line is fatal. Blank lines are
/// skipped. A line over `max_line` bytes ends the stream with `InvalidData`.
pub fn read_documents<R, F>(mut reader: R, max_line: usize, mut on_document: F) -> io::Result<()>
where
    R: BufRead,
    F: FnMut(Result<Value, serde_json::Error>),
{
    let mut line = Vec::new();

    loop {
        line.clear();
        let limit = u64::try_from(max_line)
            .map_err(|_| invalid_data("line cap exceeds u64"))?
            .saturating_add(2);
        let read = reader.by_ref().take(limit).read_until(b'\n', &mut line)?;

        if read == 0 {
            return Ok(());
        }

        // The cap counts content only, not the CRLF or LF terminator.
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.len() > max_line {
            return Err(invalid_data(format!(
                "line too large: more than {max_line} bytes"
            )));
        }

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        on_document(serde_json::from_slice(&line));
    }
}

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

pub(crate) fn json_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Button, Buttons, DipSwitches};
    use std::io::{BufReader, Cursor};

    fn collect(input: &[u8], cap: usize) -> (Vec<Value>, usize, io::Result<()>) {
        let mut documents = Vec::new();
        let mut malformed = 0;
        let result = read_documents(Cursor::new(input.to_vec()), cap, |doc| match doc {
            Ok(value) => documents.push(value),
            Err(_) => malformed += 1,
        });
        (documents, malformed, result)
    }

    #[test]
    fn reads_one_document_per_line() {
        let (docs, malformed, result) = collect(b"{\"a\":1}\n{\"b\":2}\r\n\n{\"c\":3}", 1024);
        result.expect("read documents");
        assert_eq!(malformed, 0);
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0]["a"], 1);
        assert_eq!(docs[1]["b"], 2);
        assert_eq!(docs[2]["c"], 3);
    }

    #[test]
    fn documents_split_across_reads_are_reassembled() {
        // A one-byte buffer forces every document to arrive in fragments.
        let data = b"{\"sevenSegment\":{\"zero\":5}}\n{\"x\":true}\n".to_vec();
        let reader = BufReader::with_capacity(1, Cursor::new(data));
        let mut docs = Vec::new();
        read_documents(reader, 1024, |doc| docs.push(doc.expect("valid json")))
            .expect("read documents");

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["sevenSegment"]["zero"], 5);
        assert_eq!(docs[1]["x"], true);
    }

    #[test]
    fn malformed_line_is_reported_and_reading_continues() {
        let (docs, malformed, result) = collect(b"{\"a\":1}\nnot json\n{\"b\":2}\n", 1024);
        result.expect("read documents");
        assert_eq!(malformed, 1);
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn oversized_line_is_rejected() {
        let (docs, _, result) = collect(b"{\"a\":\"0123456789\"}\n", 8);
        let err = result.expect_err("expected too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(docs.is_empty());
    }

    #[test]
    fn line_exactly_at_cap_is_accepted() {
        let (docs, _, result) = collect(b"[1,2,3]\n", 7);
        result.expect("read documents");
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn crlf_line_at_cap_is_accepted_and_one_over_is_not() {
        let (docs, _, result) = collect(b"[1,2,3]\r\n[4,5,6]\r\n", 7);
        result.expect("read documents");
        assert_eq!(docs, [serde_json::json!([1, 2, 3]), serde_json::json!([4, 5, 6])]);

        let (docs, _, result) = collect(b"[1,2,3] \r\n", 7);
        let err = result.expect_err("expected too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(docs.is_empty());
    }

    #[test]
    fn encodes_update_input_envelope() {
        let arguments = InputState {
            button: Buttons::with(Button::Top, true),
            dip_switches: DipSwitches::from_packed(129),
            ..InputState::default()
        };
        let encoded =
            encode_panel_message(&update_input_message(arguments)).expect("encode update");

        let value: Value = serde_json::from_slice(&encoded).expect("parse encoded json");
        assert_eq!(value["command"], "updateInput");
        assert_eq!(value["arguments"]["button"]["top"], true);
        assert_eq!(value["arguments"]["dip_switches"], 129);
        assert_eq!(value["arguments"]["joystick"], serde_json::json!({}));
    }

    #[test]
    fn decodes_board_update_envelope() {
        let payload = br#"{"type":"boardUpdate","body":{"ledArray":{"r":[1,0]},"sevenSegment":{"zero":5}}}"#;
        match decode_host_message(payload).expect("decode board update") {
            HostMessage::BoardUpdate { body } => {
                assert_eq!(body.led_array.r, Some(vec![1, 0]));
                assert_eq!(body.seven_segment.zero, Some(5));
            }
            other => panic!("expected board update, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_fails_to_decode() {
        let err = decode_host_message(br#"{"type":"reboot"}"#).expect_err("unknown tag");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn panel_notices_accept_missing_value() {
        let message: PanelMessage =
            serde_json::from_str(r#"{"command":"onInfo"}"#).expect("decode notice");
        assert_eq!(message, PanelMessage::Info { value: None });
    }

    #[test]
    fn document_without_board_fields_only_echoes() {
        let messages = host_messages_for_document(&serde_json::json!({"outputs":{"counter":1}}));
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], HostMessage::TerminalOutput { .. }));
    }

    #[test]
    fn document_with_board_fields_yields_update() {
        let document = serde_json::json!({"ledArray":{"r":[1]},"sevenSegment":{"zero":5}});
        let messages = host_messages_for_document(&document);
        assert_eq!(messages.len(), 2);
        match &messages[1] {
            HostMessage::BoardUpdate { body } => assert_eq!(body.seven_segment.zero, Some(5)),
            other => panic!("expected board update, got {other:?}"),
        }
    }
}

//! Notebook output records and the transformer applied to kernel messages.
//!
//! Output shapes follow the official [nbformat v4] schema. Besides the plain
//! message-to-output conversion, this module implements the stream
//! coalescing applied to mirrored cell outputs: consecutive `stream` records
//! with the same name are merged, and carriage returns and backspaces are
//! resolved the way a terminal emulator would display them.
//!
//! [nbformat v4]: https://github.com/jupyter/nbformat/blob/v5.10.4/nbformat/v4/nbformat.v4.schema.json

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::wire_protocol::{
    DisplayDataContent, ErrorContent, ExecuteResultContent, KernelMessage, KernelMessageType,
    StreamContent,
};
use crate::Error;

/// Output from executing a code cell.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    /// Execution result output.
    ExecuteResult(ExecuteResult),

    /// Display data output.
    DisplayData(DisplayData),

    /// Stream output.
    Stream(Stream),

    /// Error output.
    Error(ErrorOutput),
}

/// Result of executing a code cell.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteResult {
    /// Execution count of the result.
    pub execution_count: Option<i32>,

    /// Data returned by the execution.
    pub data: Map<String, Value>,

    /// Metadata associated with the result.
    pub metadata: Map<String, Value>,
}

/// Display data output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DisplayData {
    /// Data to display.
    pub data: Map<String, Value>,

    /// Metadata associated with the display data.
    pub metadata: Map<String, Value>,
}

/// Stream output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    /// Name of the stream (e.g., stdout or stderr).
    pub name: String,

    /// Text content of the stream.
    pub text: MultilineString,
}

/// Error output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ErrorOutput {
    /// Name of the error.
    pub ename: String,

    /// Value or message of the error.
    pub evalue: String,

    /// Traceback of the error.
    pub traceback: Vec<String>,
}

/// Represents a string or array of strings (multiline).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum MultilineString {
    /// Single-line string.
    Single(String),

    /// Multi-line array of strings.
    Multi(Vec<String>),
}

impl MultilineString {
    /// View the text as its list-of-strings accumulator form, converting a
    /// single string in place if needed.
    pub fn make_multi(&mut self) -> &mut Vec<String> {
        if let MultilineString::Single(s) = self {
            *self = MultilineString::Multi(vec![std::mem::take(s)]);
        }
        match self {
            MultilineString::Multi(v) => v,
            MultilineString::Single(_) => unreachable!(),
        }
    }
}

impl From<MultilineString> for String {
    fn from(m: MultilineString) -> Self {
        match m {
            MultilineString::Single(s) => s,
            MultilineString::Multi(v) if v.len() == 1 => v.into_iter().next().unwrap(),
            MultilineString::Multi(v) => v.join("\n"),
        }
    }
}

/// Convert a kernel message into an output record.
///
/// Returns `Ok(None)` for message types that do not produce an output
/// (status updates, input echoes, and so on), and an error if the content
/// does not match the advertised type.
pub fn output_from_msg(msg: &KernelMessage) -> Result<Option<Output>, Error> {
    fn content<T: serde::de::DeserializeOwned>(msg: &KernelMessage) -> Result<T, Error> {
        serde_json::from_value(msg.content.clone())
            .map_err(|err| Error::DeserializeMessage(err.to_string()))
    }

    let output = match msg.header.msg_type {
        KernelMessageType::Stream => {
            let c: StreamContent = content(msg)?;
            Output::Stream(Stream {
                name: c.name,
                text: MultilineString::Single(c.text),
            })
        }
        KernelMessageType::DisplayData => {
            let c: DisplayDataContent = content(msg)?;
            Output::DisplayData(DisplayData {
                data: c.data,
                metadata: c.metadata,
            })
        }
        KernelMessageType::ExecuteResult => {
            let c: ExecuteResultContent = content(msg)?;
            Output::ExecuteResult(ExecuteResult {
                execution_count: Some(c.execution_count),
                data: c.data,
                metadata: c.metadata,
            })
        }
        KernelMessageType::Error => {
            let c: ErrorContent = content(msg)?;
            Output::Error(ErrorOutput {
                ename: c.ename,
                evalue: c.evalue,
                traceback: c.traceback,
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(output))
}

/// Simulate backspaces in the text.
///
/// Each `\b` erases the previously emitted character, except across line
/// boundaries.
pub fn handle_backspace(s: &str) -> String {
    let mut out: Vec<char> = Vec::with_capacity(s.len());
    for c in s.chars() {
        if c == '\u{0008}' {
            if let Some(&last) = out.last() {
                if last != '\n' && last != '\r' {
                    out.pop();
                }
            }
        } else {
            out.push(c);
        }
    }
    out.into_iter().collect()
}

/// Handle text the same way that a terminal emulator would display it.
///
/// Within each line, a `\r` rewinds the write cursor to column 0 and the
/// following characters overwrite prior ones in place.
pub fn handle_carriage_return(s: &str) -> String {
    let mut processed_lines = Vec::new();

    for line in s.split('\n') {
        let chars: Vec<char> = line.chars().collect();
        let mut result: Vec<char> = Vec::with_capacity(chars.len());
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '\r' {
                // Move cursor to start of the line and overwrite.
                i += 1;
                let mut overwrite_chars = Vec::new();
                while i < chars.len() && chars[i] != '\r' {
                    overwrite_chars.push(chars[i]);
                    i += 1;
                }
                for (j, c) in overwrite_chars.into_iter().enumerate() {
                    if j < result.len() {
                        result[j] = c;
                    } else {
                        result.push(c);
                    }
                }
            } else {
                result.push(chars[i]);
                i += 1;
            }
        }
        processed_lines.push(result.into_iter().collect::<String>());
    }

    processed_lines.join("\n")
}

/// Append a stream output to a cell's output list, coalescing it with the
/// previous record when that record is also a stream with the same name.
///
/// The authoritative merged text lives in the cell output itself: each
/// incoming chunk loses one trailing newline and becomes an entry of the
/// list-of-strings accumulator, and any chunk whose merge introduces `\r`
/// or `\b` is rewritten in place, preserving a trailing `\r` so a later
/// chunk can still overwrite the line.
pub fn append_stream(outputs: &mut Vec<Output>, stream: Stream) {
    let mut text: String = stream.text.into();
    if text.ends_with('\n') {
        text.pop();
    }

    let merged = match outputs.last_mut() {
        Some(Output::Stream(last)) if last.name == stream.name => Some(last),
        _ => None,
    };
    let Some(last) = merged else {
        outputs.push(Output::Stream(Stream {
            name: stream.name,
            text: MultilineString::Multi(vec![handle_carriage_return(&handle_backspace(&text))]),
        }));
        return;
    };

    let entries = last.text.make_multi();
    let old_text = entries.last().cloned().unwrap_or_default();
    let mut combined = old_text + &text;
    if combined.contains('\r') || combined.contains('\u{0008}') {
        let suffix = if combined.ends_with('\r') {
            combined.pop();
            "\r"
        } else {
            ""
        };
        let new_text = handle_carriage_return(&handle_backspace(&combined)) + suffix;
        match entries.last_mut() {
            Some(entry) => *entry = new_text,
            None => entries.push(new_text),
        }
    } else {
        entries.push(text);
    }
}

/// Join the `"ename: evalue"` lines of the error outputs in a result.
pub fn error_summary(outputs: &[Output]) -> String {
    outputs
        .iter()
        .filter_map(|output| match output {
            Output::Error(err) => Some(format!("{}: {}", err.ename, err.evalue)),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stream(name: &str, text: &str) -> Stream {
        Stream {
            name: name.into(),
            text: MultilineString::Single(text.into()),
        }
    }

    fn entries(outputs: &[Output]) -> Vec<String> {
        match outputs.last() {
            Some(Output::Stream(Stream {
                text: MultilineString::Multi(v),
                ..
            })) => v.clone(),
            other => panic!("expected a coalesced stream output, got {other:?}"),
        }
    }

    #[test]
    fn backspace_erases_previous_characters() {
        assert_eq!(handle_backspace("ab\u{8}\u{8}c"), "c");
        assert_eq!(handle_backspace("a\u{8}b"), "b");
        assert_eq!(handle_backspace("\u{8}"), "");
        assert_eq!(handle_backspace("a\n\u{8}b"), "a\nb");
    }

    #[test]
    fn carriage_return_overwrites_in_place() {
        assert_eq!(handle_carriage_return("abc\rxy"), "xyc");
        assert_eq!(handle_carriage_return("abc\rxyzw"), "xyzw");
        assert_eq!(handle_carriage_return("a\nb\rc"), "a\nc");
        assert_eq!(handle_carriage_return("plain text"), "plain text");
    }

    #[test]
    fn stream_chunks_with_same_name_coalesce() {
        let mut outputs = Vec::new();
        append_stream(&mut outputs, stream("stdout", "1\n"));
        append_stream(&mut outputs, stream("stdout", "2\n"));
        append_stream(&mut outputs, stream("stdout", "3\n"));
        assert_eq!(outputs.len(), 1);
        assert_eq!(entries(&outputs), vec!["1", "2", "3"]);
    }

    #[test]
    fn stream_chunks_with_different_names_stay_apart() {
        let mut outputs = Vec::new();
        append_stream(&mut outputs, stream("stdout", "out\n"));
        append_stream(&mut outputs, stream("stderr", "err\n"));
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn progress_bar_overwrites_previous_percentage() {
        let mut outputs = Vec::new();
        append_stream(&mut outputs, stream("stdout", "0%"));
        append_stream(&mut outputs, stream("stdout", "\r50%"));
        append_stream(&mut outputs, stream("stdout", "\r100%\n"));
        assert_eq!(entries(&outputs), vec!["100%"]);
    }

    #[test]
    fn trailing_carriage_return_is_preserved_for_later_chunks() {
        let mut outputs = Vec::new();
        append_stream(&mut outputs, stream("stdout", "working"));
        append_stream(&mut outputs, stream("stdout", " 1/2\r"));
        assert_eq!(entries(&outputs), vec!["working 1/2\r"]);
        append_stream(&mut outputs, stream("stdout", "done!\n"));
        assert_eq!(entries(&outputs), vec!["done!ng 1/2"]);
    }

    #[test]
    fn merged_text_matches_terminal_normalisation_of_concatenation() {
        let chunks = ["abc", "def\rxy\n", "z\n"];
        let mut outputs = Vec::new();
        for chunk in chunks {
            append_stream(&mut outputs, stream("stdout", chunk));
        }
        let mut concat: String = chunks.concat();
        concat.pop();
        let expected = handle_carriage_return(&handle_backspace(&concat));
        let joined: String = match outputs.pop().unwrap() {
            Output::Stream(s) => s.text.into(),
            other => panic!("expected stream, got {other:?}"),
        };
        assert_eq!(joined, expected);
        assert_eq!(joined, "xycdef\nz");
    }

    #[test]
    fn stream_message_converts_to_output() {
        let msg = KernelMessage::new(
            KernelMessageType::Stream,
            json!({"name": "stdout", "text": "hello buddy\n"}),
        );
        let output = output_from_msg(&msg).unwrap().unwrap();
        assert_eq!(
            serde_json::to_string(&output).unwrap(),
            r#"{"output_type":"stream","name":"stdout","text":"hello buddy\n"}"#
        );
    }

    #[test]
    fn error_message_converts_to_output() {
        let msg = KernelMessage::new(
            KernelMessageType::Error,
            json!({
                "ename": "ZeroDivisionError",
                "evalue": "division by zero",
                "traceback": ["Traceback (most recent call last)"]
            }),
        );
        let output = output_from_msg(&msg).unwrap().unwrap();
        assert_eq!(
            error_summary(&[output]),
            "ZeroDivisionError: division by zero"
        );
    }

    #[test]
    fn status_message_produces_no_output() {
        let msg = KernelMessage::new(
            KernelMessageType::Status,
            json!({"execution_state": "busy"}),
        );
        assert!(output_from_msg(&msg).unwrap().is_none());
    }

    #[test]
    fn malformed_content_is_an_error() {
        let msg = KernelMessage::new(KernelMessageType::Stream, json!({"name": "stdout"}));
        assert!(output_from_msg(&msg).is_err());
    }
}

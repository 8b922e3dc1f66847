use std::io::BufRead;

use crate::ClientError;

/// One server-sent event: `event:` name plus the joined `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Iterator over SSE frames read line-wise from a response body.
pub struct SseFrames<R: BufRead> {
    reader: R,
    done: bool,
}

impl<R: BufRead> SseFrames<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for SseFrames<R> {
    type Item = Result<SseFrame, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut event = String::new();
        let mut data_lines: Vec<String> = Vec::new();

        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    if event.is_empty() && data_lines.is_empty() {
                        return None;
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(ClientError::ServerUnreachable(err.to_string())));
                }
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if event.is_empty() && data_lines.is_empty() {
                    // Leading blank line between frames.
                    continue;
                }
                break;
            }
            if let Some(rest) = line.strip_prefix(':') {
                // Keep-alive comment.
                let _ = rest;
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }

        Some(Ok(SseFrame {
            event,
            data: data_lines.join("\n"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frames(input: &str) -> Vec<SseFrame> {
        SseFrames::new(Cursor::new(input.to_string()))
            .collect::<Result<Vec<_>, _>>()
            .expect("parse")
    }

    #[test]
    fn test_parses_event_and_data() {
        let parsed = frames("event: output\ndata: {\"text\":\"0\\n\"}\n\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].event, "output");
        assert_eq!(parsed[0].data, "{\"text\":\"0\\n\"}");
    }

    #[test]
    fn test_parses_multiple_frames_in_order() {
        let parsed = frames(
            "event: output\ndata: a\n\nevent: result\ndata: b\n\nevent: done\ndata: {}\n\n",
        );
        let names: Vec<&str> = parsed.iter().map(|f| f.event.as_str()).collect();
        assert_eq!(names, vec!["output", "result", "done"]);
    }

    #[test]
    fn test_skips_keepalive_comments() {
        let parsed = frames(": keepalive\n\nevent: done\ndata: {}\n\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].event, "done");
    }

    #[test]
    fn test_final_frame_without_trailing_blank_line() {
        let parsed = frames("event: done\ndata: {}");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].event, "done");
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let parsed = frames("event: result\ndata: line1\ndata: line2\n\n");
        assert_eq!(parsed[0].data, "line1\nline2");
    }
}

//! Minimal server-sent-events parsing for assertions.

/// One parsed `data:` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub data: String,
}

impl SseFrame {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).expect("frame payload is not JSON")
    }

    pub fn is_done(&self) -> bool {
        self.json().get("__done").and_then(|v| v.as_bool()) == Some(true)
    }

    pub fn is_error(&self) -> bool {
        self.json().get("__error").is_some()
    }
}

/// Split an event-stream body into its `data:` frames.
pub fn parse_sse_frames(body: &str) -> Vec<SseFrame> {
    body.split("\n\n")
        .filter_map(|chunk| {
            let chunk = chunk.trim();
            chunk.strip_prefix("data: ").map(|data| SseFrame {
                data: data.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_split_on_blank_lines() {
        let body = "data: {\"i\":0}\n\ndata: {\"i\":1}\n\ndata: {\"__done\":true}\n\n";
        let frames = parse_sse_frames(body);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].json()["i"], 0);
        assert!(!frames[0].is_done());
        assert!(frames[2].is_done());
    }

    #[test]
    fn error_frames_are_recognized() {
        let body = "data: {\"__error\":{\"name\":\"Boom\",\"message\":\"x\"}}\n\n";
        let frames = parse_sse_frames(body);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_error());
        assert!(!frames[0].is_done());
    }
}

//! Incremental parsing of upstream server-sent events.

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Parse a single SSE frame from the buffer.
///
/// Returns the frame (if it carried data) and the remaining buffer content,
/// or `None` when no complete frame is buffered yet.
#[must_use]
pub fn parse_sse_frame(buffer: &str) -> Option<(Option<SseFrame>, String)> {
    let (end, sep_len) = match (buffer.find("\n\n"), buffer.find("\r\n\r\n")) {
        (Some(a), Some(b)) if b < a => (b, 4),
        (Some(a), _) => (a, 2),
        (None, Some(b)) => (b, 4),
        (None, None) => return None,
    };
    let frame = &buffer[..end];
    let remainder = buffer[end + sep_len..].to_string();

    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in frame.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    // Comments and keep-alives carry no data
    if data.is_empty() {
        return Some((None, remainder));
    }

    Some((
        Some(SseFrame {
            event,
            data: data.join("\n"),
        }),
        remainder,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_frame_waits() {
        assert!(parse_sse_frame("data: {\"a\":1}\n").is_none());
    }

    #[test]
    fn parses_event_and_data() {
        let (frame, rest) =
            parse_sse_frame("event: ping\ndata: {}\n\ndata: next").unwrap();
        let frame = frame.unwrap();
        assert_eq!(frame.event.as_deref(), Some("ping"));
        assert_eq!(frame.data, "{}");
        assert_eq!(rest, "data: next");
    }

    #[test]
    fn comment_frames_are_skipped() {
        let (frame, rest) = parse_sse_frame(": keep-alive\n\n").unwrap();
        assert!(frame.is_none());
        assert!(rest.is_empty());
    }

    #[test]
    fn crlf_delimiters_are_accepted() {
        let (frame, _) = parse_sse_frame("data: [DONE]\r\n\r\n").unwrap();
        assert_eq!(frame.unwrap().data, "[DONE]");
    }
}

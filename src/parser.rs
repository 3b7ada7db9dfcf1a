// Slice-based STOMP frame parser (produces owned Vecs from input slices)

/// A frame lifted out of the input buffer, still in raw byte form.
///
/// Header names and values are returned escaped, exactly as they appeared
/// on the wire; the codec decides whether to unescape them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub command: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
    /// Number of input bytes the frame occupied, including the NUL and an
    /// optional trailing LF.
    pub consumed: usize,
}

type ParseResult = Result<Option<RawFrame>, String>;

/// Extract the optional content-length header value from a header list.
///
/// Returns:
/// - Ok(Some(n)) when a valid content-length header is present and parsed.
/// - Ok(None) when no content-length header is present.
/// - Err(String) when content-length is present but not a valid unsigned integer.
fn get_content_length(headers: &[(Vec<u8>, Vec<u8>)]) -> Result<Option<usize>, String> {
    // repeated headers: the first occurrence is the one the sender meant
    for (k, v) in headers {
        if k.as_slice() == b"content-length" {
            let s =
                std::str::from_utf8(v).map_err(|e| format!("content-length not utf8: {}", e))?;
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Err("empty content-length".to_string());
            }
            return trimmed
                .parse::<usize>()
                .map(Some)
                .map_err(|e| format!("invalid content-length '{}': {}", trimmed, e));
        }
    }
    Ok(None)
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Parse a single STOMP frame from a raw byte slice.
///
/// Returns `Ok(Some(RawFrame))` when a full frame was parsed, `Ok(None)`
/// when more bytes are required and `Err` on protocol errors. Leading LFs
/// are skipped; the codec reports those as heartbeats before calling here.
pub fn parse_frame_slice(input: &[u8]) -> ParseResult {
    let mut pos = 0usize;
    let len = input.len();

    while pos < len && (input[pos] == b'\n' || input[pos] == b'\r') {
        pos += 1;
    }

    // command line
    let cmd_end_rel = match input[pos..].iter().position(|&b| b == b'\n') {
        Some(i) => i,
        None => {
            if input[pos..].contains(&0) {
                return Err("NUL before end of command line".to_string());
            }
            return Ok(None);
        }
    };
    let command = strip_cr(&input[pos..pos + cmd_end_rel]).to_vec();
    if command.contains(&0) {
        return Err("NUL before end of command line".to_string());
    }
    pos += cmd_end_rel + 1;

    // headers until an empty line
    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    loop {
        if pos >= len {
            return Ok(None);
        }
        if input[pos] == b'\n' {
            pos += 1;
            break;
        }
        if input[pos] == b'\r' && pos + 1 < len && input[pos + 1] == b'\n' {
            pos += 2;
            break;
        }
        let line_end_rel = match input[pos..].iter().position(|&b| b == b'\n') {
            Some(i) => i,
            None => {
                if input[pos..].contains(&0) {
                    return Err("unterminated header line".to_string());
                }
                return Ok(None);
            }
        };
        let line = strip_cr(&input[pos..pos + line_end_rel]);
        match line.iter().position(|&b| b == b':') {
            Some(colon) => {
                headers.push((line[..colon].to_vec(), line[colon + 1..].to_vec()));
            }
            None => {
                return Err(format!(
                    "malformed header line: {:?}",
                    String::from_utf8_lossy(line)
                ));
            }
        }
        pos += line_end_rel + 1;
    }

    let body = match get_content_length(&headers)? {
        Some(content_len) => {
            // need content_len bytes plus the terminating NUL
            if pos + content_len + 1 > len {
                return Ok(None);
            }
            let body = input[pos..pos + content_len].to_vec();
            pos += content_len;
            if input[pos] != 0 {
                return Err("missing NUL terminator after content-length body".to_string());
            }
            pos += 1;
            body
        }
        None => match input[pos..].iter().position(|&b| b == 0) {
            Some(nul_rel) => {
                let body = input[pos..pos + nul_rel].to_vec();
                pos += nul_rel + 1;
                body
            }
            None => return Ok(None),
        },
    };

    // optional trailing EOL after the NUL
    if pos < len && input[pos] == b'\n' {
        pos += 1;
    } else if pos + 1 < len && input[pos] == b'\r' && input[pos + 1] == b'\n' {
        pos += 2;
    }

    Ok(Some(RawFrame {
        command,
        headers,
        body,
        consumed: pos,
    }))
}

/// Escape a STOMP 1.2 header name or value for wire transmission.
///
/// backslash → `\\`, carriage return → `\r`, line feed → `\n`,
/// colon → `\c`.
pub fn escape_header_value(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            ':' => result.push_str("\\c"),
            _ => result.push(ch),
        }
    }
    result
}

/// Undo [`escape_header_value`]. Any other escape sequence, or a trailing
/// lone backslash, is a protocol error.
pub fn unescape_header_value(input: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'r') => out.push(b'\r'),
            Some(b'n') => out.push(b'\n'),
            Some(b'c') => out.push(b':'),
            Some(other) => return Err(format!("invalid escape sequence '\\{}'", *other as char)),
            None => return Err("incomplete escape sequence at end of header".to_string()),
        }
    }
    Ok(out)
}

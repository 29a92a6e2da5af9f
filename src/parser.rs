use email_address::EmailAddress;
use mail_parser::MessageParser;

/// One header as it appeared on the wire. `raw` keeps the original folded
/// text (line endings normalized to CRLF) because DKIM canonicalization
/// needs it; `value` is unfolded and trimmed for ordinary consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
    pub raw: String,
}

#[derive(Debug, Default)]
pub struct HeaderScan {
    pub headers: Vec<RawHeader>,
    /// Byte offset of the body within the original input (past the blank
    /// separator line). Equals the input length when no body exists.
    pub body_offset: usize,
}

impl HeaderScan {
    pub fn last(&self, name: &str) -> Option<&RawHeader> {
        self.headers
            .iter()
            .rev()
            .find(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a RawHeader> {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
    }
}

/// Walk the header block of a raw message. Accepts `\n` as well as `\r\n`,
/// unfolds continuation lines, stops at the first blank line. Lines without
/// a colon that are not continuations are skipped rather than treated as
/// fatal.
pub fn scan_headers(raw: &[u8]) -> HeaderScan {
    let mut scan = HeaderScan {
        headers: Vec::new(),
        body_offset: raw.len(),
    };
    let mut pos = 0;

    while pos < raw.len() {
        let line_end = raw[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i + 1)
            .unwrap_or(raw.len());
        let line = &raw[pos..line_end];
        let content = trim_line_ending(line);

        if content.is_empty() {
            scan.body_offset = line_end;
            return scan;
        }

        let text = String::from_utf8_lossy(content);
        if content[0] == b' ' || content[0] == b'\t' {
            if let Some(last) = scan.headers.last_mut() {
                last.raw.push_str(&text);
                last.raw.push_str("\r\n");
                last.value.push(' ');
                last.value.push_str(text.trim());
            }
        } else if let Some(colon) = text.find(':') {
            let (name, rest) = text.split_at(colon);
            scan.headers.push(RawHeader {
                name: name.trim_end().to_string(),
                value: rest[1..].trim().to_string(),
                raw: format!("{text}\r\n"),
            });
        }

        pos = line_end;
    }

    scan
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Domain of the visible `From` header (the DMARC identifier). Empty when
/// the message carries no From; a parse failure falls back to the raw
/// substring after the last `@`.
pub fn from_domain(raw: &[u8]) -> String {
    let scan = scan_headers(raw);
    match scan.last("From") {
        Some(from) => domain_of_header_value(&from.value),
        None => MessageParser::default()
            .parse(raw)
            .as_ref()
            .and_then(|m| m.from())
            .and_then(|f| f.first())
            .and_then(|a| a.address())
            .map(|addr| raw_domain_fallback(addr).to_ascii_lowercase())
            .unwrap_or_default(),
    }
}

fn domain_of_header_value(value: &str) -> String {
    let spec = match (value.rfind('<'), value.rfind('>')) {
        (Some(open), Some(close)) if close > open => &value[open + 1..close],
        _ => value,
    };

    if let Ok(address) = spec.trim().parse::<EmailAddress>() {
        return address.domain().to_ascii_lowercase();
    }

    raw_domain_fallback(value).to_ascii_lowercase()
}

fn raw_domain_fallback(value: &str) -> &str {
    let Some(at) = value.rfind('@') else {
        return "";
    };
    let rest = &value[at + 1..];
    let end = rest
        .find(|c: char| c.is_ascii_whitespace() || c == '>')
        .unwrap_or(rest.len());
    &rest[..end]
}

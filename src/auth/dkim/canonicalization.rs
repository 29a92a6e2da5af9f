//! RFC 6376 §3.4 canonicalization. Inputs are header/body text with CRLF
//! line endings (the header scanner normalizes bare LF on the way in).

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalizationAlgorithm {
    Simple,
    Relaxed,
}

/// The `c=` tag: header algorithm, then body algorithm. A missing body
/// algorithm defaults to simple, a missing tag to simple/simple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canonicalization {
    pub header: CanonicalizationAlgorithm,
    pub body: CanonicalizationAlgorithm,
}

impl Default for Canonicalization {
    fn default() -> Self {
        Canonicalization {
            header: CanonicalizationAlgorithm::Simple,
            body: CanonicalizationAlgorithm::Simple,
        }
    }
}

impl FromStr for Canonicalization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (header, body) = match s.split_once('/') {
            Some((header, body)) => (header, body),
            None => (s, "simple"),
        };
        let parse = |value: &str| match value {
            "simple" => Ok(CanonicalizationAlgorithm::Simple),
            "relaxed" => Ok(CanonicalizationAlgorithm::Relaxed),
            other => Err(format!("unknown canonicalization `{other}`")),
        };
        Ok(Canonicalization {
            header: parse(header)?,
            body: parse(body)?,
        })
    }
}

impl std::fmt::Display for Canonicalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = |algorithm| match algorithm {
            CanonicalizationAlgorithm::Simple => "simple",
            CanonicalizationAlgorithm::Relaxed => "relaxed",
        };
        write!(f, "{}/{}", name(self.header), name(self.body))
    }
}

impl CanonicalizationAlgorithm {
    /// Canonicalize the message body. Simple reduces trailing empty lines
    /// to a single CRLF (an empty body becomes exactly CRLF); relaxed also
    /// strips trailing whitespace per line and collapses inner runs.
    pub fn canonicalize_body(self, body: &str) -> String {
        let mut lines: Vec<String> = split_lines(body)
            .map(|line| match self {
                CanonicalizationAlgorithm::Simple => line.to_string(),
                CanonicalizationAlgorithm::Relaxed => collapse_wsp(line.trim_end_matches([' ', '\t'])),
            })
            .collect();

        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }

        if lines.is_empty() {
            return match self {
                CanonicalizationAlgorithm::Simple => "\r\n".to_string(),
                CanonicalizationAlgorithm::Relaxed => String::new(),
            };
        }

        let mut out = String::with_capacity(body.len());
        for line in &lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }

    /// Canonicalize one header (the full folded text including its name).
    /// Simple is the identity; relaxed lowercases the name, unfolds, and
    /// collapses whitespace. The relaxed form carries no trailing CRLF.
    pub fn canonicalize_header(self, header: &str) -> String {
        match self {
            CanonicalizationAlgorithm::Simple => header.to_string(),
            CanonicalizationAlgorithm::Relaxed => {
                let unfolded = header.replace("\r\n", "").replace('\n', "");
                match unfolded.split_once(':') {
                    Some((name, value)) => format!(
                        "{}:{}",
                        name.trim().to_ascii_lowercase(),
                        collapse_wsp(value.trim())
                    ),
                    None => collapse_wsp(unfolded.trim()),
                }
            }
        }
    }

    pub fn canonicalize_headers(self, headers: &[String]) -> String {
        let mut out = String::new();
        for header in headers {
            out.push_str(&self.canonicalize_header(header));
            if self == CanonicalizationAlgorithm::Relaxed {
                out.push_str("\r\n");
            }
        }
        out
    }
}

/// Split on CRLF, tolerating bare LF.
fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line))
}

/// Reduce every WSP run to a single SP. Callers trim trailing whitespace
/// beforehand; a leading run stays as one SP per RFC 6376 §3.4.4.
fn collapse_wsp(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_wsp = false;
    for c in text.chars() {
        if c == ' ' || c == '\t' {
            in_wsp = true;
        } else {
            if in_wsp {
                out.push(' ');
            }
            in_wsp = false;
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use base64ct::{Base64, Encoding};
    use sha2::{Digest, Sha256};

    fn sha256_b64(data: &str) -> String {
        Base64::encode_string(Sha256::digest(data.as_bytes()).as_slice())
    }

    #[test]
    fn simple_empty_body_hash() {
        let body = CanonicalizationAlgorithm::Simple.canonicalize_body("");
        assert_eq!(body, "\r\n");
        assert_eq!(
            sha256_b64(&body),
            "frcCV1k9oG9oKj3dpUqdJg1PxRT2RSN/XKdLCPjaYaY="
        );
    }

    #[test]
    fn relaxed_empty_body_hash() {
        let body = CanonicalizationAlgorithm::Relaxed.canonicalize_body("");
        assert_eq!(body, "");
        assert_eq!(
            sha256_b64(&body),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[test]
    fn relaxed_body_collapses_whitespace_and_trailing_lines() {
        let body = " C \r\nD \t E\r\n\r\n\r\n";
        assert_eq!(
            CanonicalizationAlgorithm::Relaxed.canonicalize_body(body),
            " C\r\nD E\r\n"
        );
    }

    #[test]
    fn relaxed_body_keeps_inner_empty_lines() {
        let body = " C \r\nD \t E\r\n\r\n\r\nok";
        assert_eq!(
            CanonicalizationAlgorithm::Relaxed.canonicalize_body(body),
            " C\r\nD E\r\n\r\n\r\nok\r\n"
        );
    }

    #[test]
    fn simple_body_keeps_interior_whitespace() {
        let body = " C \r\nD \t E\r\n\r\n\r\n";
        assert_eq!(
            CanonicalizationAlgorithm::Simple.canonicalize_body(body),
            " C \r\nD \t E\r\n"
        );
    }

    #[test]
    fn relaxed_header_lowercases_and_unfolds() {
        assert_eq!(
            CanonicalizationAlgorithm::Relaxed.canonicalize_header("A: X\r\n"),
            "a:X"
        );
        assert_eq!(
            CanonicalizationAlgorithm::Relaxed.canonicalize_header("B : Y\t\r\n\tZ \r\n"),
            "b:Y Z"
        );
    }

    #[test]
    fn simple_header_is_identity() {
        let header = "B : Y\t\r\n\tZ  \r\n";
        assert_eq!(
            CanonicalizationAlgorithm::Simple.canonicalize_header(header),
            header
        );
    }

    #[test]
    fn header_block_join() {
        let headers = vec!["A: X\r\n".to_string(), "B : Y\t\r\n\tZ \r\n".to_string()];
        assert_eq!(
            CanonicalizationAlgorithm::Relaxed.canonicalize_headers(&headers),
            "a:X\r\nb:Y Z\r\n"
        );
        assert_eq!(
            CanonicalizationAlgorithm::Simple.canonicalize_headers(&headers),
            "A: X\r\nB : Y\t\r\n\tZ \r\n"
        );
    }

    #[test]
    fn tag_parses_both_forms() {
        let c: Canonicalization = "relaxed/simple".parse().unwrap();
        assert_eq!(c.header, CanonicalizationAlgorithm::Relaxed);
        assert_eq!(c.body, CanonicalizationAlgorithm::Simple);

        let c: Canonicalization = "relaxed".parse().unwrap();
        assert_eq!(c.body, CanonicalizationAlgorithm::Simple);

        assert!("chunky/simple".parse::<Canonicalization>().is_err());
    }
}

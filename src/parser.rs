//! Incremental XML parsing for the outgoing S2S stream.
//!
//! The handshake only ever needs to recognize a small, fixed vocabulary of
//! top-level elements (stream header, features, STARTTLS responses, SASL
//! responses, dialback elements, stream errors). This parser accumulates
//! bytes read off the wire and emits one complete element at a time without
//! buffering more of the stream than necessary.

use crate::error::S2sError;

/// Namespace URIs used during S2S negotiation.
pub mod ns {
    /// XMPP server namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Server dialback namespace (XEP-0220)
    pub const DIALBACK: &str = "jabber:server:dialback";
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by peer)
    pub id: Option<String>,
    /// The 'version' attribute
    pub version: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from raw XML data.
    ///
    /// Handles the special case of XMPP stream headers, which are
    /// intentionally unclosed XML (the closing tag arrives at session end).
    pub fn parse(data: &str) -> Result<Self, S2sError> {
        let mut header = StreamHeader::default();

        let stream_start = data
            .find("<stream:stream")
            .ok_or_else(|| S2sError::parse("no stream:stream element found"))?;

        let stream_end = data[stream_start..]
            .find('>')
            .map(|i| stream_start + i)
            .ok_or_else(|| S2sError::parse("incomplete stream header"))?;

        let tag = &data[stream_start..=stream_end];

        header.to = extract_attribute(tag, "to");
        header.from = extract_attribute(tag, "from");
        header.id = extract_attribute(tag, "id");
        header.version = extract_attribute(tag, "version");

        Ok(header)
    }

    /// Major version number, defaulting to 0 if absent or unparseable.
    pub fn major_version(&self) -> u32 {
        self.version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

/// Incremental XML parser for the outgoing S2S stream.
pub struct XmlParser {
    buffer: Vec<u8>,
    stream_started: bool,
}

impl XmlParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            stream_started: false,
        }
    }

    /// Feed newly-read bytes into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Whether a complete stream header has arrived in the buffer.
    pub fn has_stream_header(&self) -> bool {
        let s = String::from_utf8_lossy(&self.buffer);
        s.contains("<stream:stream") && s.contains('>')
    }

    /// Extract the stream header. Does not consume the buffer, since
    /// stanzas may immediately follow it on the same read.
    pub fn take_stream_header(&mut self) -> Result<StreamHeader, S2sError> {
        let data = String::from_utf8_lossy(&self.buffer).to_string();
        let header = StreamHeader::parse(&data)?;
        self.stream_started = true;
        Ok(header)
    }

    /// Whether the parser has seen a stream header yet.
    pub fn stream_started(&self) -> bool {
        self.stream_started
    }

    /// Parse and consume the next complete top-level element from the buffer.
    ///
    /// Returns `Ok(None)` if no complete element is available yet.
    pub fn next_stanza(&mut self) -> Result<Option<ParsedStanza>, S2sError> {
        let data = String::from_utf8_lossy(&self.buffer).to_string();

        if let Some(pos) = data.find("</stream:stream>") {
            self.buffer = self.buffer[pos + "</stream:stream>".len()..].to_vec();
            return Ok(Some(ParsedStanza::StreamEnd));
        }

        type StanzaParser = fn(&str) -> Result<ParsedStanza, S2sError>;
        // Order matters: more specific prefixes before less specific ones.
        let patterns: &[(&str, StanzaParser)] = &[
            ("<proceed", parse_tls_proceed),
            ("<stream:features", parse_stream_features),
            ("<stream:error", parse_stream_error),
            ("<success", parse_sasl_success),
            ("<failure", parse_failure),
            ("<db:result", parse_dialback_result),
            ("<db:verify", parse_dialback_verify),
        ];

        for (pattern, parser) in patterns {
            if let Some(start) = data.find(pattern) {
                let tag_name = pattern[1..].trim();
                if let Some(end) = find_stanza_end(&data, start, tag_name) {
                    let stanza_xml = &data[start..end];
                    let result = parser(stanza_xml)?;
                    self.buffer = data.as_bytes()[end..].to_vec();
                    return Ok(Some(result));
                }
            }
        }

        Ok(None)
    }

    /// Discard all buffered state. Used when rebinding the reader to a
    /// freshly-negotiated TLS stream.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.stream_started = false;
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_stanza_end(data: &str, start: usize, tag_name: &str) -> Option<usize> {
    let after_start = &data[start..];

    if let Some(gt_pos) = after_start.find('>') {
        if gt_pos > 0 && after_start.as_bytes()[gt_pos - 1] == b'/' {
            return Some(start + gt_pos + 1);
        }
    }

    let close_tag = format!("</{}", tag_name);
    if let Some(close_start) = after_start.find(&close_tag) {
        if let Some(close_end) = after_start[close_start..].find('>') {
            return Some(start + close_start + close_end + 1);
        }
    }

    None
}

/// Parsed stanza variants relevant to the outgoing handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedStanza {
    /// Peer accepted the STARTTLS request
    TlsProceed,
    /// Stream features element
    Features {
        /// Whether `<starttls/>` is advertised
        starttls: bool,
        /// Whether STARTTLS is marked `<required/>`
        starttls_required: bool,
        /// Whether a dialback offer element is present
        dialback: bool,
        /// SASL mechanisms advertised
        sasl_mechanisms: Vec<String>,
    },
    /// Stream-level error
    StreamError {
        /// Defined-condition element name
        condition: String,
        /// Optional human-readable text
        text: Option<String>,
    },
    /// SASL `<success/>`
    SaslSuccess,
    /// A `<failure/>` element, disambiguated by namespace at the call site
    /// (it is emitted both by STARTTLS and by SASL).
    Failure {
        /// Namespace of the enclosing failure element, if recognized
        namespace: Option<String>,
        /// Defined-condition child element name, if present
        condition: Option<String>,
    },
    /// Stream close
    StreamEnd,
    /// XEP-0220 dialback result (request or response depending on presence
    /// of `type`)
    DialbackResult {
        from: String,
        to: String,
        key: Option<String>,
        result_type: Option<String>,
    },
    /// XEP-0220 dialback verify (request or response)
    DialbackVerify {
        from: String,
        to: String,
        id: String,
        key: Option<String>,
        result_type: Option<String>,
    },
}

fn parse_tls_proceed(data: &str) -> Result<ParsedStanza, S2sError> {
    if data.contains("proceed") {
        Ok(ParsedStanza::TlsProceed)
    } else {
        Err(S2sError::parse("invalid proceed element"))
    }
}

fn parse_stream_features(data: &str) -> Result<ParsedStanza, S2sError> {
    let starttls = data.contains("<starttls");
    let starttls_required = starttls && data.contains("<required");
    let dialback = data.contains(ns::DIALBACK) || data.contains("dialback");

    let mut sasl_mechanisms = Vec::new();
    let mut search_pos = 0;
    while let Some(start) = data[search_pos..].find("<mechanism>") {
        let actual_start = search_pos + start + "<mechanism>".len();
        if let Some(end) = data[actual_start..].find("</mechanism>") {
            sasl_mechanisms.push(data[actual_start..actual_start + end].trim().to_string());
            search_pos = actual_start + end;
        } else {
            break;
        }
    }

    Ok(ParsedStanza::Features {
        starttls,
        starttls_required,
        dialback,
        sasl_mechanisms,
    })
}

fn parse_stream_error(data: &str) -> Result<ParsedStanza, S2sError> {
    const CONDITIONS: &[&str] = &[
        "bad-format",
        "conflict",
        "connection-timeout",
        "host-gone",
        "host-unknown",
        "internal-server-error",
        "invalid-from",
        "invalid-namespace",
        "not-authorized",
        "policy-violation",
        "remote-connection-failed",
        "reset",
        "see-other-host",
        "system-shutdown",
        "undefined-condition",
        "unsupported-version",
    ];

    let condition = CONDITIONS
        .iter()
        .find(|c| data.contains(*c))
        .map(|c| c.to_string())
        .unwrap_or_else(|| "undefined-condition".to_string());

    let text = extract_element_text(data, "text");

    Ok(ParsedStanza::StreamError { condition, text })
}

fn parse_sasl_success(data: &str) -> Result<ParsedStanza, S2sError> {
    if data.contains(ns::SASL) {
        Ok(ParsedStanza::SaslSuccess)
    } else {
        Err(S2sError::parse("invalid success element"))
    }
}

fn parse_failure(data: &str) -> Result<ParsedStanza, S2sError> {
    let namespace = [ns::TLS, ns::SASL]
        .iter()
        .find(|ns| data.contains(**ns))
        .map(|ns| ns.to_string());

    const KNOWN_CONDITIONS: &[&str] = &[
        "aborted",
        "not-authorized",
        "temporary-auth-failure",
        "invalid-mechanism",
        "malformed-request",
    ];
    let condition = KNOWN_CONDITIONS
        .iter()
        .find(|c| data.contains(*c))
        .map(|c| c.to_string());

    Ok(ParsedStanza::Failure {
        namespace,
        condition,
    })
}

fn extract_element_text(data: &str, tag: &str) -> Option<String> {
    let start = data.find(&format!("<{}", tag))?;
    let content_start = data[start..].find('>').map(|i| start + i + 1)?;
    let close_tag = format!("</{}>", tag);
    let content_end = data[content_start..].find(&close_tag)? + content_start;
    let text = data[content_start..content_end].trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn parse_dialback_result(data: &str) -> Result<ParsedStanza, S2sError> {
    let from = extract_attribute(data, "from")
        .ok_or_else(|| S2sError::parse("db:result missing 'from'"))?;
    let to = extract_attribute(data, "to")
        .ok_or_else(|| S2sError::parse("db:result missing 'to'"))?;
    let result_type = extract_attribute(data, "type");
    let key = if result_type.is_none() {
        extract_element_content(data, "db:result")
    } else {
        None
    };

    Ok(ParsedStanza::DialbackResult {
        from,
        to,
        key,
        result_type,
    })
}

fn parse_dialback_verify(data: &str) -> Result<ParsedStanza, S2sError> {
    let from = extract_attribute(data, "from")
        .ok_or_else(|| S2sError::parse("db:verify missing 'from'"))?;
    let to = extract_attribute(data, "to")
        .ok_or_else(|| S2sError::parse("db:verify missing 'to'"))?;
    let id = extract_attribute(data, "id")
        .ok_or_else(|| S2sError::parse("db:verify missing 'id'"))?;
    let result_type = extract_attribute(data, "type");
    let key = if result_type.is_none() {
        extract_element_content(data, "db:verify")
    } else {
        None
    };

    Ok(ParsedStanza::DialbackVerify {
        from,
        to,
        id,
        key,
        result_type,
    })
}

fn extract_element_content(data: &str, tag: &str) -> Option<String> {
    let content_start = data.find('>').map(|i| i + 1)?;
    let close_tag = format!("</{}>", tag);
    let content_end = data.find(&close_tag)?;
    if content_start >= content_end {
        return None;
    }
    let content = data[content_start..content_end].trim();
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header_parsing() {
        let header_xml = r#"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:server' to='example.com' from='other.com' version='1.0' id='abc123'>"#;
        let header = StreamHeader::parse(header_xml).unwrap();
        assert_eq!(header.to, Some("example.com".to_string()));
        assert_eq!(header.from, Some("other.com".to_string()));
        assert_eq!(header.id, Some("abc123".to_string()));
        assert_eq!(header.major_version(), 1);
    }

    #[test]
    fn test_stream_header_missing_version() {
        let header_xml = "<stream:stream xmlns:stream='http://etherx.jabber.org/streams'>";
        let header = StreamHeader::parse(header_xml).unwrap();
        assert_eq!(header.major_version(), 0);
    }

    #[test]
    fn test_parser_features_starttls_and_dialback() {
        let mut parser = XmlParser::new();
        parser.feed(
            b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls><dialback xmlns='urn:xmpp:features:dialback'/></stream:features>",
        );

        let stanza = parser.next_stanza().unwrap().unwrap();
        match stanza {
            ParsedStanza::Features {
                starttls,
                starttls_required,
                dialback,
                sasl_mechanisms,
            } => {
                assert!(starttls);
                assert!(starttls_required);
                assert!(dialback);
                assert!(sasl_mechanisms.is_empty());
            }
            _ => panic!("expected Features"),
        }
    }

    #[test]
    fn test_parser_features_sasl_external() {
        let mut parser = XmlParser::new();
        parser.feed(b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>EXTERNAL</mechanism></mechanisms></stream:features>");

        let stanza = parser.next_stanza().unwrap().unwrap();
        match stanza {
            ParsedStanza::Features {
                sasl_mechanisms, ..
            } => assert_eq!(sasl_mechanisms, vec!["EXTERNAL".to_string()]),
            _ => panic!("expected Features"),
        }
    }

    #[test]
    fn test_parser_tls_proceed() {
        let mut parser = XmlParser::new();
        parser.feed(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert_eq!(
            parser.next_stanza().unwrap(),
            Some(ParsedStanza::TlsProceed)
        );
    }

    #[test]
    fn test_parser_sasl_success() {
        let mut parser = XmlParser::new();
        parser.feed(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        assert_eq!(
            parser.next_stanza().unwrap(),
            Some(ParsedStanza::SaslSuccess)
        );
    }

    #[test]
    fn test_parser_sasl_failure() {
        let mut parser = XmlParser::new();
        parser.feed(
            b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>",
        );
        let stanza = parser.next_stanza().unwrap().unwrap();
        match stanza {
            ParsedStanza::Failure {
                namespace,
                condition,
            } => {
                assert_eq!(namespace, Some(ns::SASL.to_string()));
                assert_eq!(condition, Some("not-authorized".to_string()));
            }
            _ => panic!("expected Failure"),
        }
    }

    #[test]
    fn test_parser_stream_error() {
        let mut parser = XmlParser::new();
        parser.feed(b"<stream:error><not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/><text xmlns='urn:ietf:params:xml:ns:xmpp-streams'>TLS is mandatory, but was not established.</text></stream:error>");
        let stanza = parser.next_stanza().unwrap().unwrap();
        match stanza {
            ParsedStanza::StreamError { condition, text } => {
                assert_eq!(condition, "not-authorized");
                assert_eq!(
                    text,
                    Some("TLS is mandatory, but was not established.".to_string())
                );
            }
            _ => panic!("expected StreamError"),
        }
    }

    #[test]
    fn test_parser_dialback_result_request() {
        let mut parser = XmlParser::new();
        parser.feed(b"<db:result from='a.test' to='b.test'>somekey</db:result>");
        let stanza = parser.next_stanza().unwrap().unwrap();
        match stanza {
            ParsedStanza::DialbackResult {
                from,
                to,
                key,
                result_type,
            } => {
                assert_eq!(from, "a.test");
                assert_eq!(to, "b.test");
                assert_eq!(key, Some("somekey".to_string()));
                assert_eq!(result_type, None);
            }
            _ => panic!("expected DialbackResult"),
        }
    }

    #[test]
    fn test_parser_dialback_result_response() {
        let mut parser = XmlParser::new();
        parser.feed(b"<db:result from='b.test' to='a.test' type='valid'/>");
        let stanza = parser.next_stanza().unwrap().unwrap();
        match stanza {
            ParsedStanza::DialbackResult { result_type, .. } => {
                assert_eq!(result_type, Some("valid".to_string()));
            }
            _ => panic!("expected DialbackResult"),
        }
    }

    #[test]
    fn test_parser_stream_end() {
        let mut parser = XmlParser::new();
        parser.feed(b"</stream:stream>");
        assert_eq!(parser.next_stanza().unwrap(), Some(ParsedStanza::StreamEnd));
    }

    #[test]
    fn test_parser_incomplete_returns_none() {
        let mut parser = XmlParser::new();
        parser.feed(b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'>");
        assert_eq!(parser.next_stanza().unwrap(), None);
    }
}

//! Per-connection classification state machine
//!
//! A [`FlowClassifier`] lives inside a connection entry until the entry
//! reaches a terminal decision. Each buffer update drives it through three
//! phases: guess the application protocol from the first complete line of
//! either direction, fix the client/server orientation, and resolve a mark
//! through the rule set. Only the first line of each direction is ever
//! inspected; the per-direction `hint` values report how many bytes the
//! connection may permanently discard from the front of its buffers.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::bytes::{Regex, RegexBuilder};
use tracing::debug;

use crate::conn::DirectionState;
use crate::rules::{RuleProtocol, RuleSet, MARK_NO_MATCH, MARK_NO_MATCH_YET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolGuess {
    Unknown,
    Http,
    Ftp,
    Other,
}

/// Client/server orientation of a flow, relative to the ingress direction.
/// Three-valued: an HTTP response fixes the orientation without classifying,
/// so `Unknown` must be distinguishable from both oriented states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionHint {
    Unknown,
    IngressIsClient,
    IngressIsServer,
}

fn icase(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("hard-coded pattern")
}

fn http_request_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| icase(r"^([a-z]+) (.*) HTTP(/.*)?\r?$"))
}

fn http_response_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| icase(r"^HTTP(/[0-9\.]+)? [0-9]+"))
}

/// First complete line of `buffer` starting at `start`. A line ends at the
/// first `\r` or `\n`; without a terminator there is no line yet.
fn first_line(buffer: &[u8], start: usize) -> Option<&[u8]> {
    let haystack = &buffer[start..];
    let eol = haystack.iter().position(|&b| b == b'\r' || b == b'\n')?;
    Some(&haystack[..eol])
}

fn parse_request_line(line: &[u8]) -> Option<(String, String)> {
    let caps = http_request_line().captures(line)?;
    let method = String::from_utf8_lossy(&caps[1]).into_owned();
    let url = String::from_utf8_lossy(&caps[2]).into_owned();
    Some((method, url))
}

fn is_response_line(line: &[u8]) -> bool {
    http_response_line().is_match(line)
}

pub struct FlowClassifier {
    rules: Arc<RuleSet>,
    guess: ProtocolGuess,
    egress_hint: u64,
    ingress_hint: u64,
    direction: DirectionHint,
    classified: bool,
    mark: u32,
}

impl FlowClassifier {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self {
            rules,
            guess: ProtocolGuess::Unknown,
            egress_hint: 0,
            ingress_hint: 0,
            direction: DirectionHint::Unknown,
            classified: false,
            mark: MARK_NO_MATCH_YET,
        }
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn egress_hint(&self) -> u64 {
        self.egress_hint
    }

    pub fn ingress_hint(&self) -> u64 {
        self.ingress_hint
    }

    pub fn direction(&self) -> DirectionHint {
        self.direction
    }

    pub fn protocol_guess(&self) -> ProtocolGuess {
        self.guess
    }

    /// Re-run the state machine after a buffer update. Returns true iff the
    /// classification is now definitive.
    pub fn update(&mut self, egress: &DirectionState, ingress: &DirectionState) -> bool {
        if self.classified {
            return true;
        }

        if self.guess == ProtocolGuess::Unknown {
            self.guess = self.guess_protocol(egress, ingress);
            match self.guess {
                ProtocolGuess::Unknown => self.mark = MARK_NO_MATCH_YET,
                ProtocolGuess::Other => {
                    self.mark = MARK_NO_MATCH;
                    self.classified = true;
                }
                ProtocolGuess::Http | ProtocolGuess::Ftp => {}
            }
        }

        match self.guess {
            ProtocolGuess::Http => self.update_http(egress, ingress),
            // FTP rules can be declared but no detection heuristic fires yet.
            ProtocolGuess::Ftp => {}
            ProtocolGuess::Unknown | ProtocolGuess::Other => {}
        }

        self.classified
    }

    /// Swap the per-direction state for a flow whose orientation was created
    /// backwards. `Unknown` orientation stays unknown.
    pub fn reverse(&mut self) {
        std::mem::swap(&mut self.egress_hint, &mut self.ingress_hint);
        self.direction = match self.direction {
            DirectionHint::IngressIsClient => DirectionHint::IngressIsServer,
            DirectionHint::IngressIsServer => DirectionHint::IngressIsClient,
            DirectionHint::Unknown => DirectionHint::Unknown,
        };
    }

    /// Protocol detection from the first line of each direction. `Other` is
    /// only returned once both directions hold a complete non-matching line;
    /// until then the verdict may still change.
    fn guess_protocol(&self, egress: &DirectionState, ingress: &DirectionState) -> ProtocolGuess {
        let mut enough_material = true;

        for (dir, hint) in [(ingress, self.ingress_hint), (egress, self.egress_hint)] {
            if dir.buffer.is_empty() {
                enough_material = false;
                continue;
            }
            match first_line(&dir.buffer, buffer_start(dir, hint)) {
                Some(line) => {
                    if http_request_line().is_match(line) || is_response_line(line) {
                        return ProtocolGuess::Http;
                    }
                }
                None => enough_material = false,
            }
        }

        if enough_material {
            ProtocolGuess::Other
        } else {
            ProtocolGuess::Unknown
        }
    }

    fn update_http(&mut self, egress: &DirectionState, ingress: &DirectionState) {
        // The http matcher only ever looks at the very first line, so
        // neither hint may have advanced.
        assert_eq!(self.egress_hint, 0);
        assert_eq!(self.ingress_hint, 0);

        if pending_len(ingress, self.ingress_hint) > 0
            && self.direction != DirectionHint::IngressIsServer
        {
            self.http_handle_buffer(true, ingress);
        }
        if pending_len(egress, self.egress_hint) > 0
            && self.direction != DirectionHint::IngressIsClient
        {
            self.http_handle_buffer(false, egress);
        }
    }

    fn http_handle_buffer(&mut self, ingress: bool, dir: &DirectionState) {
        let Some(line) = first_line(&dir.buffer, 0) else {
            return;
        };

        if let Some((method, url)) = parse_request_line(line) {
            debug!("http request line: method={} url={}", method, url);
            self.mark = self.rules.classify(RuleProtocol::Http, &method, &url);
            self.direction = if ingress {
                DirectionHint::IngressIsClient
            } else {
                DirectionHint::IngressIsServer
            };
            self.classified = true;
        } else if is_response_line(line) {
            self.direction = if ingress {
                DirectionHint::IngressIsServer
            } else {
                DirectionHint::IngressIsClient
            };
        } else {
            debug!("not an http connection");
            self.mark = MARK_NO_MATCH;
            self.classified = true;
        }
    }
}

/// Offset of the first unconsumed byte within the in-memory buffer, given
/// that `dir.bytes - dir.buffer.len()` bytes were already dropped from the
/// front.
fn buffer_start(dir: &DirectionState, hint: u64) -> usize {
    let dropped = dir.bytes - dir.buffer.len() as u64;
    assert!(hint >= dropped && hint - dropped <= dir.buffer.len() as u64);
    (hint - dropped) as usize
}

/// Bytes not yet consumed by the classifier in this direction.
fn pending_len(dir: &DirectionState, hint: u64) -> u64 {
    dir.bytes - hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ClassificationRule;

    fn rules_get_42() -> Arc<RuleSet> {
        let mut rule = ClassificationRule::new(RuleProtocol::Http, 42);
        rule.set_method_literal("GET").unwrap();
        let mut set = RuleSet::new();
        set.push(rule);
        Arc::new(set)
    }

    fn dir(data: &[u8]) -> DirectionState {
        let mut d = DirectionState::default();
        if !data.is_empty() {
            d.packets = 1;
            d.bytes = data.len() as u64;
            d.buffer = data.to_vec();
        }
        d
    }

    #[test]
    fn test_request_line_regex() {
        assert!(parse_request_line(b"GET /index.html HTTP/1.1").is_some());
        assert!(parse_request_line(b"get /lower.html http/1.0").is_some());
        // Pre-1.0 requests have no version token.
        let (method, url) = parse_request_line(b"POST /form HTTP").unwrap();
        assert_eq!(method, "POST");
        assert_eq!(url, "/form");
        assert!(parse_request_line(b"NOT A REQUEST").is_none());
        assert!(parse_request_line(b"\x16\x03\x01\x02\x00\x01").is_none());
    }

    #[test]
    fn test_response_line_regex() {
        assert!(is_response_line(b"HTTP/1.1 200 OK"));
        assert!(is_response_line(b"HTTP/1.0 404 Not Found"));
        assert!(is_response_line(b"HTTP 302"));
        assert!(!is_response_line(b"SSH-2.0-OpenSSH_9.6"));
    }

    #[test]
    fn test_request_on_ingress_classifies() {
        let mut cl = FlowClassifier::new(rules_get_42());
        let ingress = dir(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        let classified = cl.update(&dir(b""), &ingress);

        assert!(classified);
        assert_eq!(cl.mark(), 42);
        assert_eq!(cl.direction(), DirectionHint::IngressIsClient);
    }

    #[test]
    fn test_response_first_fixes_direction_only() {
        let mut cl = FlowClassifier::new(rules_get_42());
        let ingress = dir(b"HTTP/1.1 200 OK\r\n");
        let classified = cl.update(&dir(b""), &ingress);

        assert!(!classified);
        assert_eq!(cl.mark(), MARK_NO_MATCH_YET);
        assert_eq!(cl.direction(), DirectionHint::IngressIsServer);

        // The request line then arrives on the other direction.
        let egress = dir(b"GET / HTTP/1.1\r\n");
        let classified = cl.update(&egress, &ingress);
        assert!(classified);
        assert_eq!(cl.mark(), 42);
        assert_eq!(cl.direction(), DirectionHint::IngressIsServer);
    }

    #[test]
    fn test_oriented_side_not_reparsed() {
        // Once ingress is known to be the server, its buffer must not be fed
        // to the request matcher again.
        let mut cl = FlowClassifier::new(rules_get_42());
        let ingress = dir(b"HTTP/1.1 200 OK\r\n");
        cl.update(&dir(b""), &ingress);
        let classified = cl.update(&dir(b""), &ingress);
        assert!(!classified);
        assert_eq!(cl.direction(), DirectionHint::IngressIsServer);
    }

    #[test]
    fn test_non_http_both_sides_is_other() {
        let mut cl = FlowClassifier::new(rules_get_42());
        let egress = dir(b"\x16\x03\x01\x02\x00\x01\n");
        let ingress = dir(b"random junk\n");
        let classified = cl.update(&egress, &ingress);

        assert!(classified);
        assert_eq!(cl.protocol_guess(), ProtocolGuess::Other);
        assert_eq!(cl.mark(), MARK_NO_MATCH);
    }

    #[test]
    fn test_one_silent_side_stays_unknown() {
        let mut cl = FlowClassifier::new(rules_get_42());
        let egress = dir(b"\x16\x03\x01\x02\x00\x01\n");
        let classified = cl.update(&egress, &dir(b""));

        assert!(!classified);
        assert_eq!(cl.protocol_guess(), ProtocolGuess::Unknown);
        assert_eq!(cl.mark(), MARK_NO_MATCH_YET);
    }

    #[test]
    fn test_no_line_yet_stays_unknown() {
        let mut cl = FlowClassifier::new(rules_get_42());
        let classified = cl.update(&dir(b"GET / HT"), &dir(b""));
        assert!(!classified);
        assert_eq!(cl.mark(), MARK_NO_MATCH_YET);
    }

    #[test]
    fn test_unmatched_request_is_no_match() {
        let mut cl = FlowClassifier::new(rules_get_42());
        let ingress = dir(b"POST /submit HTTP/1.1\r\n");
        let classified = cl.update(&dir(b""), &ingress);
        assert!(classified);
        assert_eq!(cl.mark(), MARK_NO_MATCH);
    }

    #[test]
    fn test_reverse_round_trip() {
        let mut cl = FlowClassifier::new(rules_get_42());
        cl.update(&dir(b""), &dir(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(cl.direction(), DirectionHint::IngressIsServer);

        cl.reverse();
        assert_eq!(cl.direction(), DirectionHint::IngressIsClient);
        cl.reverse();
        assert_eq!(cl.direction(), DirectionHint::IngressIsServer);
    }

    #[test]
    fn test_reverse_keeps_unknown() {
        let mut cl = FlowClassifier::new(rules_get_42());
        cl.reverse();
        assert_eq!(cl.direction(), DirectionHint::Unknown);
    }
}

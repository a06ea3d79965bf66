//! Minimal mbox reader for mailing-list archives.
//!
//! Splits an mbox file on `From ` separator lines, parses the headers the
//! pipeline cares about (Message-ID, In-Reply-To, References, Subject, From,
//! Date), normalizes bodies for chunking, and derives thread assignments.
//! Multipart decoding and encoded-words are deliberately out: list archives
//! are overwhelmingly plain text, and a message we cannot make sense of
//! becomes a per-item failure rather than a crash.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use pipeline_common::error::ProcessingError;
use regex::Regex;

/// One email parsed out of an archive, before storage IDs are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: String,
    pub sender: String,
    pub date: Option<String>,
    pub body_normalized: String,
    pub draft_mentions: Vec<String>,
}

impl ParsedMessage {
    /// The message this one replies to, preferring In-Reply-To and falling
    /// back to the last entry of References, per RFC 5322 threading practice.
    pub fn parent_id(&self) -> Option<&str> {
        self.in_reply_to
            .as_deref()
            .or_else(|| self.references.last().map(String::as_str))
    }
}

/// Split raw mbox content into per-message blocks. The `From ` separator
/// lines themselves are not part of any message.
pub fn split_mbox(raw: &str) -> Vec<&str> {
    let mut messages = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in raw.split_inclusive('\n') {
        if line.starts_with("From ") {
            if let Some(begin) = start {
                messages.push(raw[begin..offset].trim_end_matches('\n'));
            }
            start = Some(offset + line.len());
        }
        offset += line.len();
    }
    if let Some(begin) = start {
        if begin <= raw.len() {
            messages.push(raw[begin..].trim_end_matches('\n'));
        }
    }

    messages
}

/// Parse one message block into headers + normalized body.
pub fn parse_message(raw: &str) -> Result<ParsedMessage, ProcessingError> {
    let (header_block, body) = match raw.split_once("\n\n") {
        Some((headers, body)) => (headers, body),
        // Headers only, no body
        None => (raw, ""),
    };

    let headers = parse_headers(header_block);

    let message_id = headers
        .get("message-id")
        .and_then(|value| first_angle_addr(value))
        .ok_or_else(|| ProcessingError::parse("message has no usable Message-ID header"))?;

    let in_reply_to = headers
        .get("in-reply-to")
        .and_then(|value| first_angle_addr(value));
    let references = headers
        .get("references")
        .map(|value| all_angle_addrs(value))
        .unwrap_or_default();

    let body_normalized = normalize_body(body);
    let draft_mentions = extract_draft_mentions(&body_normalized);

    Ok(ParsedMessage {
        message_id,
        in_reply_to,
        references,
        subject: headers.get("subject").cloned().unwrap_or_default(),
        sender: headers.get("from").cloned().unwrap_or_default(),
        date: headers.get("date").cloned(),
        body_normalized,
        draft_mentions,
    })
}

/// Unfold continuation lines and collect headers, lower-cased names, last
/// occurrence wins.
fn parse_headers(block: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let mut current: Option<(String, String)> = None;

    for line in block.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.insert(name, value);
        }
        if let Some((name, value)) = line.split_once(':') {
            current = Some((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }
    }
    if let Some((name, value)) = current {
        headers.insert(name, value);
    }

    headers
}

static ANGLE_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^<>\s]+>").expect("angle-addr pattern compiles"));

fn first_angle_addr(value: &str) -> Option<String> {
    ANGLE_ADDR.find(value).map(|m| m.as_str().to_owned())
}

fn all_angle_addrs(value: &str) -> Vec<String> {
    ANGLE_ADDR
        .find_iter(value)
        .map(|m| m.as_str().to_owned())
        .collect()
}

/// Clean a body for chunking: drop quoted reply lines and the trailing
/// signature, undo mbox From-stuffing, and collapse blank-line runs.
pub fn normalize_body(body: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();

    for line in body.lines() {
        // Signature delimiter; everything below is boilerplate
        if line == "-- " {
            break;
        }
        if line.starts_with('>') && !line.starts_with(">From ") {
            continue;
        }
        // Attribution line directly above dropped quoted text
        if line.trim_end().ends_with("wrote:") && kept.last().map_or(true, |l| l.trim().is_empty())
        {
            continue;
        }
        let line = line.strip_prefix('>').unwrap_or(line);
        kept.push(line);
    }

    let mut normalized = String::new();
    let mut blank_run = 0;
    for line in kept {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            normalized.push('\n');
        } else {
            blank_run = 0;
            normalized.push_str(line.trim_end());
            normalized.push('\n');
        }
    }

    normalized.trim().to_owned()
}

static DRAFT_MENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(draft-[a-z0-9][a-z0-9-]*[a-z0-9]|rfc\s?\d{3,5})\b")
        .expect("draft mention pattern compiles")
});

/// RFC and internet-draft names mentioned in a body, deduplicated in order
/// of first appearance. RFC mentions normalize to `rfcNNNN`.
pub fn extract_draft_mentions(body: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut mentions = Vec::new();

    for found in DRAFT_MENTION.find_iter(body) {
        let raw = found.as_str().to_ascii_lowercase();
        let mention = match raw.strip_prefix("rfc") {
            Some(number) => format!("rfc{}", number.trim_start()),
            None => raw,
        };
        if seen.insert(mention.clone()) {
            mentions.push(mention);
        }
    }

    mentions
}

/// Derive `thread_id` for every message: follow reply parents transitively to
/// the conversation root. A message with no parent is its own root; a chain
/// ending in a message we never saw roots the thread at that dangling id, so
/// partial archives still thread consistently. Reply cycles (which do occur
/// in the wild via broken clients) resolve to the smallest id in the cycle to
/// keep reprocessing stable.
pub fn assign_threads(messages: &[ParsedMessage]) -> HashMap<String, String> {
    let parents: HashMap<&str, Option<&str>> = messages
        .iter()
        .map(|message| (message.message_id.as_str(), message.parent_id()))
        .collect();

    let mut threads = HashMap::new();
    for message in messages {
        let mut current = message.message_id.as_str();
        let mut visited = vec![current];

        let root = loop {
            match parents.get(current) {
                // A known message with no parent is the root
                Some(None) => break current,
                Some(Some(parent)) => {
                    if visited.contains(parent) {
                        break visited.iter().min().copied().unwrap_or(current);
                    }
                    visited.push(parent);
                    current = parent;
                }
                // Dangling reference: root the thread at the missing id
                None => break current,
            }
        };

        threads.insert(message.message_id.clone(), root.to_owned());
    }

    threads
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_MBOX: &str = "\
From alice@example.org Thu Jan  1 10:00:00 2026
From: Alice <alice@example.org>
To: quic@ietf.example.org
Subject: Handshake padding question
Message-ID: <root-1@example.org>
Date: Thu, 1 Jan 2026 10:00:00 +0000

Section 8 of draft-ietf-quic-transport is unclear about padding.
See also RFC 9000 for the base behavior.

Has anyone implemented this?

From bob@example.org Thu Jan  1 11:00:00 2026
From: Bob <bob@example.org>
Subject: Re: Handshake padding question
Message-ID: <reply-1@example.org>
In-Reply-To: <root-1@example.org>
References: <root-1@example.org>
Date: Thu, 1 Jan 2026 11:00:00 +0000

On Thu, Alice wrote:
> Section 8 of draft-ietf-quic-transport is unclear about padding.

We pad to the full datagram size.

>From our tests this interoperates fine.
-- 
Bob
bob@example.org
";

    #[test]
    fn splits_messages_on_from_lines() {
        let blocks = split_mbox(SAMPLE_MBOX);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].starts_with("From: Alice"));
        assert!(blocks[1].starts_with("From: Bob"));
    }

    #[test]
    fn parses_headers_and_body() {
        let blocks = split_mbox(SAMPLE_MBOX);
        let message = parse_message(blocks[0]).unwrap();

        assert_eq!(message.message_id, "<root-1@example.org>");
        assert_eq!(message.subject, "Handshake padding question");
        assert_eq!(message.sender, "Alice <alice@example.org>");
        assert!(message.in_reply_to.is_none());
        assert!(message.body_normalized.contains("Section 8"));
        assert_eq!(
            message.draft_mentions,
            vec!["draft-ietf-quic-transport", "rfc9000"]
        );
    }

    #[test]
    fn reply_keeps_threading_headers_and_drops_quotes() {
        let blocks = split_mbox(SAMPLE_MBOX);
        let reply = parse_message(blocks[1]).unwrap();

        assert_eq!(reply.in_reply_to.as_deref(), Some("<root-1@example.org>"));
        assert_eq!(reply.references, vec!["<root-1@example.org>"]);
        // Quoted lines and the signature are gone
        assert!(!reply.body_normalized.contains("Section 8"));
        assert!(!reply.body_normalized.contains("bob@example.org"));
        // From-stuffed line is restored
        assert!(reply.body_normalized.contains("From our tests"));
        assert!(reply.body_normalized.contains("full datagram size"));
    }

    #[test]
    fn folded_headers_unfold() {
        let raw = "Subject: a subject\n spread over two lines\nMessage-ID:\n <folded@example.org>\n\nbody\n";
        let message = parse_message(raw).unwrap();
        assert_eq!(message.subject, "a subject spread over two lines");
        assert_eq!(message.message_id, "<folded@example.org>");
    }

    #[test]
    fn missing_message_id_is_a_parse_failure() {
        let raw = "From: x@example.org\nSubject: no id\n\nbody\n";
        let error = parse_message(raw).unwrap_err();
        assert!(!error.is_transient());
    }

    #[test]
    fn threads_resolve_transitively() {
        let root = message("<a@x>", None, &[]);
        let reply = message("<b@x>", Some("<a@x>"), &["<a@x>"]);
        let nested = message("<c@x>", Some("<b@x>"), &["<a@x>", "<b@x>"]);
        let unrelated = message("<d@x>", None, &[]);

        let threads = assign_threads(&[root, reply, nested, unrelated]);
        assert_eq!(threads["<a@x>"], "<a@x>");
        assert_eq!(threads["<b@x>"], "<a@x>");
        assert_eq!(threads["<c@x>"], "<a@x>");
        assert_eq!(threads["<d@x>"], "<d@x>");
    }

    #[test]
    fn dangling_parent_roots_the_thread_at_the_missing_id() {
        let orphan = message("<b@x>", Some("<gone@x>"), &["<gone@x>"]);
        let sibling = message("<c@x>", Some("<gone@x>"), &["<gone@x>"]);

        let threads = assign_threads(&[orphan, sibling]);
        assert_eq!(threads["<b@x>"], "<gone@x>");
        assert_eq!(threads["<c@x>"], "<gone@x>");
    }

    #[test]
    fn reply_cycles_resolve_deterministically() {
        let a = message("<a@x>", Some("<b@x>"), &[]);
        let b = message("<b@x>", Some("<a@x>"), &[]);

        let threads = assign_threads(&[a, b]);
        assert_eq!(threads["<a@x>"], "<a@x>");
        assert_eq!(threads["<b@x>"], "<a@x>");
    }

    #[test]
    fn thread_assignment_is_stable_under_reordering() {
        let root = message("<a@x>", None, &[]);
        let reply = message("<b@x>", Some("<a@x>"), &[]);

        let forward = assign_threads(&[root.clone(), reply.clone()]);
        let backward = assign_threads(&[reply, root]);
        assert_eq!(forward, backward);
    }

    fn message(id: &str, in_reply_to: Option<&str>, references: &[&str]) -> ParsedMessage {
        ParsedMessage {
            message_id: id.to_owned(),
            in_reply_to: in_reply_to.map(str::to_owned),
            references: references.iter().map(|r| (*r).to_owned()).collect(),
            subject: String::new(),
            sender: String::new(),
            date: None,
            body_normalized: String::new(),
            draft_mentions: Vec::new(),
        }
    }
}

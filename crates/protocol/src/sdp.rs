//! Session descriptors and candidate patching.
//!
//! The remote device does not trickle candidates: every local candidate has
//! to be inlined into the descriptor body before it is handed over. This
//! module keeps that text surgery on a structured [`SdpDocument`] (session
//! lines plus one line range per media block) so it can be tested without a
//! transport.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Offer or answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

/// An offer or answer document plus the candidates gathered for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "type")]
    pub kind: DescriptorKind,
    #[serde(rename = "sdp")]
    pub body: String,
    #[serde(skip)]
    pub candidates: Vec<Candidate>,
}

impl Descriptor {
    pub fn offer(body: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Offer,
            body: body.into(),
            candidates: Vec::new(),
        }
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self {
            kind: DescriptorKind::Answer,
            body: body.into(),
            candidates: Vec::new(),
        }
    }

    /// Returns a copy whose body carries every collected UDP candidate inline.
    pub fn finalized(&self) -> Descriptor {
        let mut doc = SdpDocument::parse(&self.body);
        for candidate in &self.candidates {
            doc.insert_candidate(candidate);
        }
        Descriptor {
            kind: self.kind,
            body: doc.render(),
            candidates: self.candidates.clone(),
        }
    }
}

/// A single candidate event from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Candidate {
    /// Index of the media block the candidate belongs to.
    pub mline_index: u16,
    /// Candidate attribute value, e.g. `candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host`.
    pub text: String,
    /// End-of-gathering marker; carries no address.
    pub terminal: bool,
}

impl Candidate {
    pub fn new(mline_index: u16, text: impl Into<String>) -> Self {
        let text = text.into();
        let terminal = text.trim().is_empty();
        Self {
            mline_index,
            text,
            terminal,
        }
    }

    /// The end-of-gathering marker.
    pub fn end_of_candidates() -> Self {
        Self {
            terminal: true,
            ..Default::default()
        }
    }

    /// Parses the standard candidate fields; `None` for terminal or malformed text.
    pub fn parse(&self) -> Option<CandidateFields<'_>> {
        if self.terminal {
            return None;
        }
        CandidateFields::parse(&self.text)
    }

    /// True when the candidate uses TCP. The device only speaks UDP.
    pub fn is_tcp(&self) -> bool {
        match self.parse() {
            Some(fields) => fields.transport.eq_ignore_ascii_case("tcp"),
            None => self.text.to_ascii_lowercase().contains("tcp"),
        }
    }

    /// Attribute line as it appears in a media block.
    pub fn attribute_line(&self) -> String {
        let text = self.text.trim();
        if text.starts_with("a=") {
            text.to_string()
        } else {
            format!("a={}", text)
        }
    }
}

/// Fields of a candidate line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFields<'a> {
    pub foundation: &'a str,
    pub component: &'a str,
    pub transport: &'a str,
    pub priority: u64,
    pub address: &'a str,
    pub port: u16,
}

impl<'a> CandidateFields<'a> {
    /// Parses `[a=]candidate:<foundation> <component> <transport> <priority> <address> <port> ...`.
    pub fn parse(text: &'a str) -> Option<Self> {
        let text = text.trim();
        let text = text.strip_prefix("a=").unwrap_or(text);
        let rest = text.strip_prefix("candidate:")?;

        let mut parts = rest.split_ascii_whitespace();
        Some(Self {
            foundation: parts.next()?,
            component: parts.next()?,
            transport: parts.next()?,
            priority: parts.next()?.parse().ok()?,
            address: parts.next()?,
            port: parts.next()?.parse().ok()?,
        })
    }
}

/// An SDP body split into a session section and per-media line ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpDocument {
    lines: Vec<String>,
    media: Vec<Range<usize>>,
}

impl SdpDocument {
    /// Parses a body with either `\r\n` or `\n` line endings.
    pub fn parse(body: &str) -> Self {
        let lines: Vec<String> = body
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect();

        let mut media: Vec<Range<usize>> = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if line.starts_with("m=") {
                if let Some(last) = media.last_mut() {
                    last.end = i;
                }
                media.push(i..lines.len());
            }
        }

        Self { lines, media }
    }

    pub fn media_count(&self) -> usize {
        self.media.len()
    }

    /// Lines of media block `index`, starting with its `m=` line.
    pub fn media_lines(&self, index: usize) -> Option<&[String]> {
        self.media.get(index).map(|range| &self.lines[range.clone()])
    }

    /// Appends a candidate line to the end of its media block.
    ///
    /// Returns false (leaving the document untouched) for terminal or TCP
    /// candidates and for an index with no matching media block.
    pub fn insert_candidate(&mut self, candidate: &Candidate) -> bool {
        if candidate.terminal || candidate.is_tcp() {
            return false;
        }
        let index = usize::from(candidate.mline_index);
        let Some(at) = self.media.get(index).map(|range| range.end) else {
            return false;
        };

        self.lines.insert(at, candidate.attribute_line());
        self.media[index].end += 1;
        for range in self.media.iter_mut().skip(index + 1) {
            range.start += 1;
            range.end += 1;
        }
        true
    }

    /// Candidate lines present anywhere in the document.
    pub fn candidates(&self) -> impl Iterator<Item = CandidateFields<'_>> {
        self.lines
            .iter()
            .filter(|line| line.starts_with("a=candidate:"))
            .filter_map(|line| CandidateFields::parse(line))
    }

    /// Address of the UDP candidate with the lowest priority, if any.
    pub fn select_connection_address(&self) -> Option<String> {
        self.candidates()
            .filter(|c| c.transport.eq_ignore_ascii_case("udp"))
            .min_by_key(|c| c.priority)
            .map(|c| c.address.to_string())
    }

    /// Replaces placeholder connection lines (`0.0.0.0` / `::`) with `address`.
    ///
    /// Every media block's placeholder is rewritten, not only the first.
    /// Returns the number of lines rewritten.
    pub fn patch_connection_address(&mut self, address: &str) -> usize {
        let family = if address.contains(':') { "IP6" } else { "IP4" };
        let mut patched = 0;
        for line in self.lines.iter_mut() {
            if line == "c=IN IP4 0.0.0.0" || line == "c=IN IP6 ::" {
                *line = format!("c=IN {} {}", family, address);
                patched += 1;
            }
        }
        patched
    }

    /// Renders the document with CRLF line endings.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.lines.iter().map(|l| l.len() + 2).sum());
        for line in &self.lines {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }
}

/// Rewrites the connection lines of `body` using the lowest-priority UDP
/// candidate already inlined in it. Bodies without such a candidate are
/// returned normalized but otherwise unchanged.
pub fn patch_connection_line(body: &str) -> String {
    let mut doc = SdpDocument::parse(body);
    if let Some(address) = doc.select_connection_address() {
        doc.patch_connection_address(&address);
    }
    doc.render()
}

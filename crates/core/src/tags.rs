//! Tag Extraction
//!
//! Agents mark the parts of their streamed output meant for another consumer with a small
//! markup grammar. [`extract`] scans a buffer for complete `<tag>…</tag>` spans and
//! [`TagScanner`] applies it incrementally to a stream of chunks, keeping only the part of
//! the stream that could still turn into a match.

use std::ops::Range;

/// Speakable text, long and short spelling.
pub const SPEAK_TAGS: &[&str] = &["speak", "s"];
/// Something the action agent did and what it saw.
pub const ACTIVITY_TAG: &str = "activity";
/// A plan or goal the speech agent hands to the action agent.
pub const INTENT_TAG: &str = "intent";

const ACTION_TAG: &str = "action";
const OBSERVATION_TAG: &str = "observation";

/// A complete tagged span found in a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch {
    pub tag: String,
    pub inner: String,
    /// Byte range of the whole span, tags included.
    pub span: Range<usize>,
}

/// Finds every complete, non-nested `<tag>…</tag>` span, leftmost first.
///
/// An opening tag only matches the first closing tag of the same name after it. An opening
/// tag with no closing counterpart yields nothing, though spans that start after it may.
pub fn extract(buffer: &str, tags: &[&str]) -> Vec<TagMatch> {
    let mut matches = Vec::new();
    let mut cursor = 0;
    while let Some((start, tag)) = find_opening(buffer, cursor, tags) {
        let inner_start = start + tag.len() + 2;
        let closing = format!("</{tag}>");
        match buffer[inner_start..].find(&closing) {
            Some(offset) => {
                let inner_end = inner_start + offset;
                let end = inner_end + closing.len();
                matches.push(TagMatch {
                    tag: tag.to_string(),
                    inner: buffer[inner_start..inner_end].to_string(),
                    span: start..end,
                });
                cursor = end;
            }
            // `<` is one byte, so `start + 1` stays on a char boundary.
            None => cursor = start + 1,
        }
    }
    matches
}

/// Returns `buffer` with the given spans removed.
pub fn strip(buffer: &str, matches: &[TagMatch]) -> String {
    let mut out = String::with_capacity(buffer.len());
    let mut cursor = 0;
    for m in matches {
        out.push_str(&buffer[cursor..m.span.start]);
        cursor = m.span.end;
    }
    out.push_str(&buffer[cursor..]);
    out
}

fn find_opening<'t>(buffer: &str, from: usize, tags: &[&'t str]) -> Option<(usize, &'t str)> {
    buffer[from..].match_indices('<').find_map(|(offset, _)| {
        let at = from + offset;
        let rest = &buffer[at + 1..];
        tags.iter()
            .find(|tag| rest.starts_with(**tag) && rest[tag.len()..].starts_with('>'))
            .map(|tag| (at, *tag))
    })
}

/// Position of the first `<` that starts an opening tag or could still become one.
fn first_live_opening(buffer: &str, tags: &[&str]) -> Option<usize> {
    buffer.match_indices('<').map(|(at, _)| at).find(|&at| {
        let rest = &buffer[at + 1..];
        tags.iter().any(|tag| {
            let opening = format!("{tag}>");
            rest.starts_with(&opening) || opening.starts_with(rest)
        })
    })
}

/// Incremental tag extraction over a stream of text chunks.
///
/// Each matched span is emitted once and removed from the internal buffer. Text that can no
/// longer be part of a match is discarded, so the buffer only holds an in-flight tag.
#[derive(Debug, Clone)]
pub struct TagScanner {
    tags: Vec<String>,
    buffer: String,
}

impl TagScanner {
    pub fn new(tags: &[&str]) -> Self {
        Self {
            tags: tags.iter().map(|t| t.to_string()).collect(),
            buffer: String::new(),
        }
    }

    /// Appends a chunk and returns the spans it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<TagMatch> {
        self.buffer.push_str(chunk);
        let tags: Vec<&str> = self.tags.iter().map(String::as_str).collect();

        let found = extract(&self.buffer, &tags);
        let remaining = if found.is_empty() {
            std::mem::take(&mut self.buffer)
        } else {
            strip(&self.buffer, &found)
        };
        self.buffer = match first_live_opening(&remaining, &tags) {
            Some(at) => remaining[at..].to_string(),
            None => String::new(),
        };
        found
    }

    /// The retained, not yet matched tail.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// A structured record of one step taken by the action agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub action: String,
    pub observation: String,
}

impl Activity {
    /// Parses the inner text of an activity tag. The action is required.
    pub fn parse(inner: &str) -> Option<Self> {
        let action = first_inner(inner, ACTION_TAG)?;
        if action.is_empty() {
            return None;
        }
        let observation = first_inner(inner, OBSERVATION_TAG).unwrap_or_default();
        Some(Self {
            action,
            observation,
        })
    }
}

fn first_inner(buffer: &str, tag: &str) -> Option<String> {
    extract(buffer, &[tag])
        .into_iter()
        .next()
        .map(|m| m.inner.trim().to_string())
}

/// A classified segment of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Speak(String),
    Activity(Activity),
    Intent(String),
}

impl Segment {
    /// Classifies a match. Empty and malformed segments yield `None`.
    pub fn from_match(m: &TagMatch) -> Option<Self> {
        let inner = m.inner.trim();
        match m.tag.as_str() {
            tag if SPEAK_TAGS.contains(&tag) && !inner.is_empty() => {
                Some(Segment::Speak(inner.to_string()))
            }
            ACTIVITY_TAG => Activity::parse(inner).map(Segment::Activity),
            INTENT_TAG if !inner.is_empty() => Some(Segment::Intent(inner.to_string())),
            _ => None,
        }
    }
}

/// A [`TagScanner`] that yields classified [`Segment`]s.
#[derive(Debug, Clone)]
pub struct SegmentScanner {
    inner: TagScanner,
}

impl SegmentScanner {
    /// Scanner for the speech agent's output: speakable text and intents.
    pub fn speech() -> Self {
        Self::with_tags(&["speak", "s", INTENT_TAG])
    }

    /// Scanner for the action agent's output: activities and speakable text.
    pub fn action() -> Self {
        Self::with_tags(&["speak", "s", ACTIVITY_TAG])
    }

    pub fn with_tags(tags: &[&str]) -> Self {
        Self {
            inner: TagScanner::new(tags),
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        self.inner
            .push(chunk)
            .iter()
            .filter_map(|m| {
                let segment = Segment::from_match(m);
                if segment.is_none() {
                    tracing::debug!(tag = %m.tag, "Dropping empty or malformed tagged segment");
                }
                segment
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

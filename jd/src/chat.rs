//! Chat turn parsing and block extraction
//!
//! A chat job's body is a running conversation. Turns are separated by `---`
//! lines and tagged with single-line directives:
//!
//! ```text
//! <!-- flow: {"id": "a1b2c3"} -->
//! ## LLM Response (2026-03-01 10:00:00)
//!
//! Here is the plan...
//!
//! <!-- flow: {"template": "chat"} -->
//! Thanks, now refine step two.
//! ```
//!
//! A directive line always starts a new turn. A directive with an `id` and no
//! `template` marks an LLM response block that can be extracted by id.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::atomic::read_document;
use crate::error::{DocError, DocResult};
use crate::frontmatter;

/// Separator placed between extracted turns
pub const TURN_SEPARATOR: &str = "\n\n---\n\n";

const LLM_HEADER: &str = "## LLM Response";

static DIRECTIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<!--\s*flow:\s*(.+?)\s*-->\s*$").expect("directive pattern is valid"));

/// Inline directive carried by a turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatDirective {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ChatDirective {
    /// Directive marking an LLM response block
    pub fn block(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Directive marking the start of a user turn rendered from a template
    pub fn template(name: impl Into<String>) -> Self {
        Self {
            template: Some(name.into()),
            ..Default::default()
        }
    }

    /// Render as the single-line comment form
    pub fn to_line(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("<!-- flow: {} -->", json)
    }

    fn from_line(line: &str) -> Option<Self> {
        let caps = DIRECTIVE_RE.captures(line.trim_end_matches('\r'))?;
        match serde_json::from_str(&caps[1]) {
            Ok(directive) => Some(directive),
            Err(e) => {
                debug!(%line, error = %e, "ChatDirective::from_line: invalid JSON, ignoring");
                None
            }
        }
    }
}

/// Who wrote a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Llm,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Llm => write!(f, "llm"),
        }
    }
}

/// One parsed turn of a chat body
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub speaker: Speaker,
    pub directive: Option<ChatDirective>,
    /// Turn text with directive, response header and quote markers removed
    pub content: String,
    /// 1-based line in the source file where the turn starts
    pub line: usize,
}

impl ChatTurn {
    /// Block id, when the turn is individually addressable
    pub fn block_id(&self) -> Option<&str> {
        self.directive.as_ref().and_then(|d| d.id.as_deref())
    }
}

#[derive(Default)]
struct RawTurn {
    directive: Option<ChatDirective>,
    lines: Vec<String>,
    first_line: usize,
}

impl RawTurn {
    fn is_blank(&self) -> bool {
        self.directive.is_none() && self.lines.iter().all(|l| l.trim().is_empty())
    }

    fn finish(self) -> Option<ChatTurn> {
        let mut lines: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        while lines.first().is_some_and(|l| l.trim().is_empty()) {
            lines.remove(0);
        }

        let is_header = lines.first().is_some_and(|l| l.starts_with(LLM_HEADER));
        if is_header {
            lines.remove(0);
        }

        let speaker = match &self.directive {
            _ if is_header => Speaker::Llm,
            Some(d) if d.id.is_some() && d.template.is_none() => Speaker::Llm,
            _ => Speaker::User,
        };

        let quoted = speaker == Speaker::User
            && lines
                .iter()
                .find(|l| !l.trim().is_empty())
                .is_some_and(|l| l.starts_with("> "));
        let content = lines
            .iter()
            .map(|l| if quoted { l.strip_prefix("> ").unwrap_or(l) } else { l })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        if content.is_empty() && self.directive.as_ref().and_then(|d| d.id.as_ref()).is_none() {
            return None;
        }

        Some(ChatTurn {
            speaker,
            directive: self.directive,
            content,
            line: self.first_line,
        })
    }
}

/// Parse a chat document (frontmatter included) into its turns
pub fn parse_chat_file(content: &str) -> DocResult<Vec<ChatTurn>> {
    debug!(len = content.len(), "parse_chat_file: called");
    let body_start = frontmatter::locate(content)?.map(|b| b.body_start).unwrap_or(0);
    let mut line_no = content[..body_start].matches('\n').count() + 1;

    let mut raw: Vec<RawTurn> = Vec::new();
    let mut current = RawTurn {
        first_line: line_no,
        ..Default::default()
    };

    for line in content[body_start..].lines() {
        if line.trim_end_matches('\r') == "---" {
            raw.push(std::mem::take(&mut current));
            current.first_line = line_no + 1;
        } else if let Some(directive) = ChatDirective::from_line(line) {
            if !current.is_blank() {
                raw.push(std::mem::take(&mut current));
            }
            current.directive = Some(directive);
            current.first_line = line_no;
        } else {
            if current.lines.iter().all(|l| l.trim().is_empty()) && line.trim().is_empty() {
                current.first_line = line_no + 1;
            }
            current.lines.push(line.trim_end_matches('\r').to_string());
        }
        line_no += 1;
    }
    raw.push(current);

    let turns: Vec<ChatTurn> = raw.into_iter().filter_map(RawTurn::finish).collect();
    debug!(count = turns.len(), "parse_chat_file: parsed turns");
    Ok(turns)
}

/// Block ids that appear on more than one turn
pub fn duplicate_block_ids(turns: &[ChatTurn]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut dupes = Vec::new();
    for id in turns.iter().filter_map(ChatTurn::block_id) {
        if !seen.insert(id) && !dupes.iter().any(|d| d == id) {
            dupes.push(id.to_string());
        }
    }
    dupes
}

/// Which part of a chat file to extract
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSelector {
    /// The whole body, ignoring block boundaries
    All,
    /// Specific block ids, in the requested order
    Ids(Vec<String>),
}

impl FromStr for BlockSelector {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(BlockSelector::All);
        }
        let ids: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Err(DocError::MalformedDocument(format!("invalid block selector: '{}'", s)));
        }
        Ok(BlockSelector::Ids(ids))
    }
}

impl fmt::Display for BlockSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSelector::All => write!(f, "all"),
            BlockSelector::Ids(ids) => write!(f, "{}", ids.join(",")),
        }
    }
}

/// Result of an extraction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    pub content: String,
    /// Ids that matched a turn
    pub found: Vec<String>,
    /// One entry per requested id that matched nothing
    pub warnings: Vec<String>,
}

/// Concatenate the turns tagged with `ids`, in request order
pub fn extract_blocks(turns: &[ChatTurn], ids: &[String]) -> Extracted {
    debug!(?ids, "extract_blocks: called");
    let mut parts = Vec::new();
    let mut found = Vec::new();
    let mut warnings = Vec::new();

    for id in ids {
        match turns.iter().find(|t| t.block_id() == Some(id.as_str())) {
            Some(turn) => {
                parts.push(turn.content.as_str());
                found.push(id.clone());
            }
            None => {
                warn!(block_id = %id, "Chat block not found");
                warnings.push(format!("block '{}' not found", id));
            }
        }
    }

    Extracted {
        content: parts.join(TURN_SEPARATOR),
        found,
        warnings,
    }
}

/// Extract content from a chat document
pub fn extract(content: &str, selector: &BlockSelector) -> DocResult<Extracted> {
    debug!(%selector, "extract: called");
    match selector {
        BlockSelector::All => {
            let doc = frontmatter::parse(content)?;
            Ok(Extracted {
                content: doc.body.trim().to_string(),
                ..Default::default()
            })
        }
        BlockSelector::Ids(ids) => {
            let turns = parse_chat_file(content)?;
            Ok(extract_blocks(&turns, ids))
        }
    }
}

/// Reference to content in another file: `file#id1,id2` or a bare `file`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlock {
    pub file: String,
    pub selector: BlockSelector,
}

impl SourceBlock {
    pub fn new(file: impl Into<String>, selector: BlockSelector) -> Self {
        Self {
            file: file.into(),
            selector,
        }
    }

    /// Read and extract the referenced content, relative to `base_dir`
    ///
    /// Fails when specific ids were requested and none of them exist.
    pub fn resolve(&self, base_dir: &Path) -> DocResult<Extracted> {
        debug!(source = %self, ?base_dir, "SourceBlock::resolve: called");
        let content = read_document(&base_dir.join(&self.file))?;
        let extracted = extract(&content, &self.selector)?;
        if let BlockSelector::Ids(ids) = &self.selector
            && extracted.found.is_empty()
        {
            return Err(DocError::BlocksNotFound(ids.clone()));
        }
        Ok(extracted)
    }
}

impl FromStr for SourceBlock {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (file, selector) = match s.split_once('#') {
            Some((file, ids)) if !ids.trim().is_empty() => (file, ids.parse()?),
            Some((file, _)) => (file, BlockSelector::All),
            None => (s, BlockSelector::All),
        };
        let file = file.trim();
        if file.is_empty() {
            return Err(DocError::MalformedDocument(format!("source block has no file: '{}'", s)));
        }
        Ok(Self::new(file, selector))
    }
}

impl fmt::Display for SourceBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            BlockSelector::All => write!(f, "{}", self.file),
            ids => write!(f, "{}#{}", self.file, ids),
        }
    }
}

/// Append an LLM response turn followed by an open user turn
pub fn append_llm_turn(content: &str, block_id: &str, timestamp: &str, response: &str) -> String {
    debug!(%block_id, "append_llm_turn: called");
    format!(
        "{}\n\n---\n\n{}\n{} ({})\n\n{}\n\n{}\n",
        content.trim_end(),
        ChatDirective::block(block_id).to_line(),
        LLM_HEADER,
        timestamp,
        response.trim(),
        ChatDirective::template("chat").to_line(),
    )
}

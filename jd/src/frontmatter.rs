//! Frontmatter codec
//!
//! A job document is a YAML mapping fenced by `---` lines, a blank line,
//! then a free-form markdown body:
//!
//! ```text
//! ---
//! id: build-api-1a2b3c4d
//! status: pending
//! ---
//!
//! Write the handler.
//! ```
//!
//! [`parse`] and [`rebuild`] are inverses. [`update`] rewrites only the
//! top-level entries it is asked to change and leaves every other byte in
//! place, so hand-written comments and key order survive status transitions.

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{DocError, DocResult};

const DELIMITER: &str = "---";

/// A parsed job document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    /// Frontmatter keys in file order
    pub metadata: Mapping,

    /// Everything after the frontmatter block and its blank separator line
    pub body: String,
}

/// Byte offsets of a frontmatter block inside a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    /// First byte of the YAML text (just past the opening delimiter line)
    pub yaml_start: usize,

    /// One past the last byte of the YAML text (start of the closing delimiter)
    pub yaml_end: usize,

    /// First byte of the body
    pub body_start: usize,
}

fn is_delimiter(line: &str) -> bool {
    line.trim_end_matches(['\n', '\r']) == DELIMITER
}

fn unterminated() -> DocError {
    DocError::MalformedDocument("frontmatter is missing its closing '---' line".to_string())
}

/// Find the frontmatter block, or `None` when the document has no metadata
pub(crate) fn locate(content: &str) -> DocResult<Option<Block>> {
    let mut lines = content.split_inclusive('\n');
    let Some(first) = lines.next() else {
        return Ok(None);
    };
    if !is_delimiter(first) {
        return Ok(None);
    }
    if !first.ends_with('\n') {
        return Err(unterminated());
    }

    let yaml_start = first.len();
    let mut offset = yaml_start;
    for line in lines {
        if is_delimiter(line) {
            let after = offset + line.len();
            let rest = &content[after..];
            let body_start = if rest.starts_with("\r\n") {
                after + 2
            } else if rest.starts_with('\n') {
                after + 1
            } else {
                after
            };
            return Ok(Some(Block {
                yaml_start,
                yaml_end: offset,
                body_start,
            }));
        }
        offset += line.len();
    }

    Err(unterminated())
}

fn parse_metadata(yaml: &str) -> DocResult<Mapping> {
    if yaml.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let value: Value = serde_yaml::from_str(yaml)
        .map_err(|e| DocError::MalformedDocument(format!("frontmatter is not valid YAML: {}", e)))?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(DocError::MalformedDocument(
            "frontmatter must be a key/value mapping".to_string(),
        )),
    }
}

/// Split a document into metadata and body
///
/// A document that does not open with `---` has empty metadata and the whole
/// content as its body.
pub fn parse(content: &str) -> DocResult<Document> {
    debug!(len = content.len(), "parse: called");
    match locate(content)? {
        Some(block) => {
            let metadata = parse_metadata(&content[block.yaml_start..block.yaml_end])?;
            Ok(Document {
                metadata,
                body: content[block.body_start..].to_string(),
            })
        }
        None => {
            debug!("parse: no frontmatter block");
            Ok(Document {
                metadata: Mapping::new(),
                body: content.to_string(),
            })
        }
    }
}

/// Serialize metadata and body in canonical form
pub fn rebuild(metadata: &Mapping, body: &str) -> DocResult<String> {
    debug!(keys = metadata.len(), "rebuild: called");
    let yaml = if metadata.is_empty() {
        String::new()
    } else {
        serde_yaml::to_string(metadata)
            .map_err(|e| DocError::MalformedDocument(format!("cannot serialize frontmatter: {}", e)))?
    };
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n\n{body}"))
}

/// Look up a string-valued metadata key
pub fn str_field<'a>(metadata: &'a Mapping, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

/// Ordered set of metadata edits applied by [`update`]
///
/// Setting a key to null or an empty string removes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    entries: Vec<(String, Option<Value>)>,
}

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Changes::insert`]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Builder form of [`Changes::delete`]
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.delete(key);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        let value = match &value {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            _ => Some(value),
        };
        self.put(key.into(), value);
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.put(key.into(), None);
    }

    fn put(&mut self, key: String, value: Option<Value>) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Edits in insertion order; `None` means delete
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }
}

/// Apply metadata edits, leaving the body and untouched keys byte-for-byte intact
///
/// Existing entries are rewritten in place, new keys are appended to the end
/// of the block, and a document without frontmatter gains one. Applying the
/// same changes twice yields the same bytes as applying them once.
pub fn update(content: &str, changes: &Changes) -> DocResult<String> {
    debug!(keys = ?changes.keys().collect::<Vec<_>>(), "update: called");

    let Some(block) = locate(content)? else {
        debug!("update: no frontmatter, creating block");
        let mut metadata = Mapping::new();
        for (key, value) in changes.iter() {
            if let Some(value) = value {
                metadata.insert(Value::String(key.to_string()), value.clone());
            }
        }
        if metadata.is_empty() {
            return Ok(content.to_string());
        }
        return rebuild(&metadata, content);
    };

    let yaml = &content[block.yaml_start..block.yaml_end];
    parse_metadata(yaml)?;

    let mut lines: Vec<String> = yaml.split_inclusive('\n').map(str::to_string).collect();
    for (key, value) in changes.iter() {
        apply_change(&mut lines, key, value)?;
    }
    let edited = lines.concat();
    parse_metadata(&edited)?;

    let mut out = String::with_capacity(content.len() + edited.len());
    out.push_str(&content[..block.yaml_start]);
    out.push_str(&edited);
    out.push_str(&content[block.yaml_end..]);
    Ok(out)
}

fn apply_change(lines: &mut Vec<String>, key: &str, value: Option<&Value>) -> DocResult<()> {
    let span = find_entry(lines, key);
    match (span, value) {
        (None, None) => {
            debug!(%key, "apply_change: delete of absent key");
        }
        (Some((start, end)), None) => {
            debug!(%key, start, end, "apply_change: deleting entry");
            lines.drain(start..end);
        }
        (None, Some(value)) => {
            debug!(%key, "apply_change: appending entry");
            let crlf = lines.first().is_some_and(|l| l.ends_with("\r\n"));
            if let Some(last) = lines.last_mut()
                && !last.ends_with('\n')
            {
                last.push('\n');
            }
            lines.extend(split_rendered(render_entry(key, value)?, crlf));
        }
        (Some((start, end)), Some(value)) => {
            debug!(%key, start, end, "apply_change: replacing entry");
            let old = &lines[start];
            let crlf = old.ends_with("\r\n");
            let mut rendered = render_entry(key, value)?;
            if end - start == 1
                && rendered.matches('\n').count() == 1
                && let Some(comment) = trailing_comment(old)
            {
                rendered = format!("{}{}\n", rendered.trim_end_matches('\n'), comment);
            }
            lines.splice(start..end, split_rendered(rendered, crlf));
        }
    }
    Ok(())
}

fn split_rendered(rendered: String, crlf: bool) -> Vec<String> {
    let rendered = if crlf { rendered.replace('\n', "\r\n") } else { rendered };
    rendered.split_inclusive('\n').map(str::to_string).collect()
}

fn render_entry(key: &str, value: &Value) -> DocResult<String> {
    let mut single = Mapping::new();
    single.insert(Value::String(key.to_string()), value.clone());
    serde_yaml::to_string(&single)
        .map_err(|e| DocError::MalformedDocument(format!("cannot serialize key '{}': {}", key, e)))
}

/// Line range `[start, end)` covering a top-level entry and its continuation lines
fn find_entry(lines: &[String], key: &str) -> Option<(usize, usize)> {
    let start = lines.iter().position(|line| entry_key(line) == Some(key))?;
    let mut end = start + 1;
    while end < lines.len() && is_continuation(&lines[end]) {
        end += 1;
    }
    // Blank lines after the entry belong to whatever follows it
    while end > start + 1 && lines[end - 1].trim().is_empty() {
        end -= 1;
    }
    Some((start, end))
}

fn entry_key(line: &str) -> Option<&str> {
    if line.starts_with([' ', '\t', '#', '-']) {
        return None;
    }
    let colon = line.find(':')?;
    let rest = &line[colon + 1..];
    if !(rest.is_empty() || rest.starts_with([' ', '\t', '\r', '\n'])) {
        return None;
    }
    Some(line[..colon].trim_end().trim_matches(|c| c == '"' || c == '\''))
}

fn is_continuation(line: &str) -> bool {
    line.starts_with([' ', '\t']) || (line.starts_with('-') && !is_delimiter(line)) || line.trim().is_empty()
}

/// Trailing `# comment` (with its leading whitespace) on an unquoted scalar entry
fn trailing_comment(line: &str) -> Option<&str> {
    let colon = line.find(':')?;
    let value = line[colon + 1..].trim_end_matches(['\r', '\n']);
    if value.contains(['"', '\'']) {
        return None;
    }
    let hash = value.find(" #").or_else(|| value.find("\t#"))?;
    let start = value[..hash].trim_end().len();
    if value[..start].trim().is_empty() {
        return None;
    }
    Some(&value[start..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const JOB: &str = "---\nid: build-api\ntitle: Build API\nstatus: pending\ntype: oneshot\ndepends_on:\n- schema\n- auth\n---\n\nWrite the handler.\n\n---\n\nNot frontmatter.\n";

    #[test]
    fn test_parse_valid_document() {
        let doc = parse(JOB).unwrap();
        assert_eq!(str_field(&doc.metadata, "id"), Some("build-api"));
        assert_eq!(str_field(&doc.metadata, "status"), Some("pending"));
        assert_eq!(doc.body, "Write the handler.\n\n---\n\nNot frontmatter.\n");
    }

    #[test]
    fn test_parse_without_blank_separator() {
        let doc = parse("---\ntitle: Test\n---\nbody line").unwrap();
        assert_eq!(str_field(&doc.metadata, "title"), Some("Test"));
        assert_eq!(doc.body, "body line");
    }

    #[test]
    fn test_parse_no_frontmatter() {
        let doc = parse("# Notes\n\nJust markdown.\n").unwrap();
        assert!(doc.metadata.is_empty());
        assert_eq!(doc.body, "# Notes\n\nJust markdown.\n");
    }

    #[test]
    fn test_parse_empty_frontmatter() {
        let doc = parse("---\n---\n\nbody").unwrap();
        assert!(doc.metadata.is_empty());
        assert_eq!(doc.body, "body");
    }

    #[test]
    fn test_parse_missing_closing_delimiter() {
        let err = parse("---\ntitle: Test\nbody without close\n").unwrap_err();
        assert!(matches!(err, DocError::MalformedDocument(_)));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let err = parse("---\ntitle: [unclosed\n---\n\nbody").unwrap_err();
        assert!(matches!(err, DocError::MalformedDocument(_)));
    }

    #[test]
    fn test_parse_non_mapping_frontmatter() {
        let err = parse("---\n- a\n- b\n---\n\nbody").unwrap_err();
        assert!(matches!(err, DocError::MalformedDocument(_)));
    }

    #[test]
    fn test_parse_crlf_delimiters() {
        let doc = parse("---\r\nid: x\r\n---\r\n\r\nbody\r\n").unwrap();
        assert_eq!(str_field(&doc.metadata, "id"), Some("x"));
        assert_eq!(doc.body, "body\r\n");
    }

    #[test]
    fn test_rebuild_layout() {
        let mut metadata = Mapping::new();
        metadata.insert("id".into(), "abc".into());
        metadata.insert("status".into(), "pending".into());
        let out = rebuild(&metadata, "Prompt\n").unwrap();
        assert_eq!(out, "---\nid: abc\nstatus: pending\n---\n\nPrompt\n");
    }

    #[test]
    fn test_rebuild_empty_metadata() {
        assert_eq!(rebuild(&Mapping::new(), "x").unwrap(), "---\n---\n\nx");
    }

    #[test]
    fn test_update_replaces_only_named_key() {
        let out = update(JOB, &Changes::new().set("status", "running")).unwrap();
        assert_eq!(out, JOB.replace("status: pending", "status: running"));
    }

    #[test]
    fn test_update_appends_new_key() {
        let out = update(JOB, &Changes::new().set("summary", "done")).unwrap();
        assert!(out.contains("- auth\nsummary: done\n---\n"));
        assert!(out.ends_with("\n\nWrite the handler.\n\n---\n\nNot frontmatter.\n"));
    }

    #[test]
    fn test_update_deletes_key_with_continuation_lines() {
        let out = update(JOB, &Changes::new().remove("depends_on")).unwrap();
        assert!(!out.contains("depends_on"));
        assert!(!out.contains("- schema"));
        assert!(out.contains("type: oneshot\n---\n\nWrite"));
    }

    #[test]
    fn test_update_empty_string_deletes() {
        let out = update(JOB, &Changes::new().set("title", "")).unwrap();
        assert!(!out.contains("title:"));
    }

    #[test]
    fn test_update_replaces_sequence_value() {
        let out = update(JOB, &Changes::new().set("depends_on", vec!["schema"])).unwrap();
        let doc = parse(&out).unwrap();
        let deps = doc.metadata.get("depends_on").and_then(Value::as_sequence).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(str_field(&doc.metadata, "type"), Some("oneshot"));
    }

    #[test]
    fn test_update_preserves_comments() {
        let content = "---\n# Job metadata\nid: x\nstatus: pending  # current state\n---\n\nbody";
        let out = update(content, &Changes::new().set("status", "completed")).unwrap();
        assert_eq!(
            out,
            "---\n# Job metadata\nid: x\nstatus: completed  # current state\n---\n\nbody"
        );
    }

    #[test]
    fn test_update_creates_frontmatter() {
        let out = update("Just a body.\n", &Changes::new().set("status", "pending")).unwrap();
        let doc = parse(&out).unwrap();
        assert_eq!(str_field(&doc.metadata, "status"), Some("pending"));
        assert_eq!(doc.body, "Just a body.\n");
    }

    #[test]
    fn test_update_rejects_malformed() {
        let err = update("---\nid: [x\n---\n\nbody", &Changes::new().set("status", "running")).unwrap_err();
        assert!(matches!(err, DocError::MalformedDocument(_)));
    }

    #[test]
    fn test_update_keeps_crlf() {
        let content = "---\r\nid: x\r\nstatus: pending\r\n---\r\n\r\nbody";
        let out = update(content, &Changes::new().set("status", "running")).unwrap();
        assert_eq!(out, "---\r\nid: x\r\nstatus: running\r\n---\r\n\r\nbody");
    }

    #[test]
    fn test_changes_last_write_wins() {
        let changes = Changes::new().set("status", "running").set("status", "failed");
        let out = update(JOB, &changes).unwrap();
        assert!(out.contains("status: failed\n"));
    }

    fn scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-z][a-z ]{0,14}[a-z]".prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ]
    }

    fn metadata() -> impl Strategy<Value = Mapping> {
        prop::collection::btree_map("[a-z][a-z_]{0,8}", scalar(), 0..6).prop_map(|entries| {
            entries
                .into_iter()
                .map(|(k, v)| (Value::String(k), v))
                .collect::<Mapping>()
        })
    }

    fn changes() -> impl Strategy<Value = Changes> {
        prop::collection::vec(("[a-z][a-z_]{0,8}", prop::option::of(scalar())), 0..5).prop_map(|edits| {
            let mut changes = Changes::new();
            for (key, value) in edits {
                match value {
                    Some(value) => changes.insert(key, value),
                    None => changes.delete(key),
                }
            }
            changes
        })
    }

    proptest! {
        #[test]
        fn test_rebuild_parse_round_trip(meta in metadata(), body in "[ -~\n]{0,200}") {
            let doc = parse(&rebuild(&meta, &body).unwrap()).unwrap();
            prop_assert_eq!(doc.metadata, meta);
            prop_assert_eq!(doc.body, body);
        }

        #[test]
        fn test_update_idempotent_and_body_stable(
            meta in metadata(),
            body in "[ -~\n]{0,200}",
            edits in changes(),
        ) {
            let original = rebuild(&meta, &body).unwrap();
            let once = update(&original, &edits).unwrap();
            let twice = update(&once, &edits).unwrap();
            prop_assert_eq!(&once, &twice);

            let doc = parse(&once).unwrap();
            prop_assert_eq!(doc.body, body);
            for (key, value) in meta.iter() {
                let name = value_key(key);
                if edits.keys().all(|k| k != name) {
                    prop_assert_eq!(doc.metadata.get(key), Some(value));
                }
            }
        }
    }

    fn value_key(key: &Value) -> &str {
        key.as_str().unwrap_or_default()
    }
}

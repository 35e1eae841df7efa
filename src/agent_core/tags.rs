//! Structural tag scanning over model output.
//!
//! The model embeds XML-like directives (`<write>`, `<rename>`, `<delete>`,
//! `<add-dependency>`, `<tool-call>`) in free text. This module scans them
//! with a small explicit state machine instead of regexes so that a
//! partially generated tag is reported as such, which is what the
//! continuation controller keys off.
//!
//! Everything here is pure and synchronous.

use crate::agent_core::types::ProblemReport;

// ─── Tag kinds ──────────────────────────────────────────────────────────────

/// Known tag names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Write,
    Rename,
    Delete,
    AddDependency,
    ToolCall,
    ProblemReport,
    /// Only meaningful inside a `problem-report` body.
    Problem,
    Think,
}

impl TagKind {
    pub fn name(self) -> &'static str {
        match self {
            TagKind::Write => "write",
            TagKind::Rename => "rename",
            TagKind::Delete => "delete",
            TagKind::AddDependency => "add-dependency",
            TagKind::ToolCall => "tool-call",
            TagKind::ProblemReport => "problem-report",
            TagKind::Problem => "problem",
            TagKind::Think => "think",
        }
    }
}

/// Kinds recognised at the top level of a buffer.
const TOP_LEVEL: &[TagKind] = &[
    TagKind::Write,
    TagKind::Rename,
    TagKind::Delete,
    TagKind::AddDependency,
    TagKind::ToolCall,
    TagKind::ProblemReport,
    TagKind::Think,
];

/// Every kind, for escaping.
const ALL: &[TagKind] = &[
    TagKind::Write,
    TagKind::Rename,
    TagKind::Delete,
    TagKind::AddDependency,
    TagKind::ToolCall,
    TagKind::ProblemReport,
    TagKind::Problem,
    TagKind::Think,
];

/// Look-alike replacement for `<` in escaped reasoning text (U+FF1C).
pub const ESCAPED_LT: char = '＜';

// ─── Scanner ────────────────────────────────────────────────────────────────

/// One scanned tag occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub kind: TagKind,
    pub attrs: Vec<(String, String)>,
    /// Text between the open and close tags (empty when self-closing).
    pub body: String,
    /// Byte offset of the opening `<`.
    pub start: usize,
    /// Byte offset just past the closing tag, or the end of the text when
    /// incomplete.
    pub end: usize,
    /// `false` when the opening tag was cut off or the body never closed.
    pub complete: bool,
}

impl Tag {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

enum ScanState {
    Outside,
    InsideOpenTag {
        kind: TagKind,
        start: usize,
    },
    InsideBody {
        kind: TagKind,
        start: usize,
        attrs: Vec<(String, String)>,
        body_start: usize,
    },
}

enum OpenTag {
    Closed {
        attrs: Vec<(String, String)>,
        end: usize,
        self_closing: bool,
    },
    Unterminated {
        attrs: Vec<(String, String)>,
    },
}

/// Scan `text` for top-level tags, in order of appearance.
///
/// A tag body is opaque: tags nested inside a complete body are not
/// reported. A tag that never closes is reported as incomplete and scanning
/// resumes right after its name, so prose that merely mentions a tag does
/// not hide the directives after it. An incomplete `<write>` runs to the end
/// of the text: nothing after it is reported.
pub fn scan(text: &str) -> Vec<Tag> {
    let mut tags = scan_kinds(text, TOP_LEVEL);
    if let Some(i) = tags
        .iter()
        .position(|t| t.kind == TagKind::Write && !t.complete)
    {
        tags.truncate(i + 1);
    }
    tags
}

fn scan_kinds(text: &str, kinds: &[TagKind]) -> Vec<Tag> {
    let mut tags = Vec::new();
    let mut state = ScanState::Outside;
    let mut pos = 0;

    loop {
        match std::mem::replace(&mut state, ScanState::Outside) {
            ScanState::Outside => {
                let Some(rel) = text[pos..].find('<') else {
                    break;
                };
                let at = pos + rel;
                match match_tag_name(text, at + 1, kinds) {
                    Some((kind, after_name)) => {
                        state = ScanState::InsideOpenTag { kind, start: at };
                        pos = after_name;
                    }
                    None => pos = at + 1,
                }
            }
            ScanState::InsideOpenTag { kind, start } => match parse_open_tag(text, pos) {
                OpenTag::Closed {
                    attrs,
                    end,
                    self_closing: true,
                } => {
                    tags.push(Tag {
                        kind,
                        attrs,
                        body: String::new(),
                        start,
                        end,
                        complete: true,
                    });
                    pos = end;
                }
                OpenTag::Closed { attrs, end, .. } => {
                    state = ScanState::InsideBody {
                        kind,
                        start,
                        attrs,
                        body_start: end,
                    };
                    pos = end;
                }
                OpenTag::Unterminated { attrs } => {
                    tags.push(Tag {
                        kind,
                        attrs,
                        body: String::new(),
                        start,
                        end: text.len(),
                        complete: false,
                    });
                    pos = start + 1 + kind.name().len();
                }
            },
            ScanState::InsideBody {
                kind,
                start,
                attrs,
                body_start,
            } => {
                let close = format!("</{}>", kind.name());
                match text[body_start..].find(&close) {
                    Some(rel) => {
                        let body_end = body_start + rel;
                        let end = body_end + close.len();
                        tags.push(Tag {
                            kind,
                            attrs,
                            body: text[body_start..body_end].to_string(),
                            start,
                            end,
                            complete: true,
                        });
                        pos = end;
                    }
                    None => {
                        tags.push(Tag {
                            kind,
                            attrs,
                            body: text[body_start..].to_string(),
                            start,
                            end: text.len(),
                            complete: false,
                        });
                        pos = body_start;
                    }
                }
            }
        }
    }

    tags
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

/// Match a known tag name at `at`. The name must be followed by whitespace,
/// `>`, `/` or the end of the text.
fn match_tag_name(text: &str, at: usize, kinds: &[TagKind]) -> Option<(TagKind, usize)> {
    let rest = &text.as_bytes()[at.min(text.len())..];
    kinds.iter().find_map(|kind| {
        let name = kind.name().as_bytes();
        if !rest.starts_with(name) {
            return None;
        }
        match rest.get(name.len()) {
            None => Some((*kind, at + name.len())),
            Some(&b) if is_space(b) || b == b'>' || b == b'/' => Some((*kind, at + name.len())),
            _ => None,
        }
    })
}

/// Parse attributes from `pos` up to and including the closing `>`.
fn parse_open_tag(text: &str, mut pos: usize) -> OpenTag {
    let bytes = text.as_bytes();
    let mut attrs = Vec::new();

    loop {
        while pos < bytes.len() && is_space(bytes[pos]) {
            pos += 1;
        }
        if pos >= bytes.len() {
            return OpenTag::Unterminated { attrs };
        }
        match bytes[pos] {
            b'>' => {
                return OpenTag::Closed {
                    attrs,
                    end: pos + 1,
                    self_closing: false,
                }
            }
            b'/' => {
                if bytes.get(pos + 1) == Some(&b'>') {
                    return OpenTag::Closed {
                        attrs,
                        end: pos + 2,
                        self_closing: true,
                    };
                }
                if pos + 1 >= bytes.len() {
                    return OpenTag::Unterminated { attrs };
                }
                pos += 1;
                continue;
            }
            _ => {}
        }

        let name_start = pos;
        while pos < bytes.len()
            && !is_space(bytes[pos])
            && !matches!(bytes[pos], b'=' | b'>' | b'/')
        {
            pos += 1;
        }
        let name = text[name_start..pos].to_string();

        while pos < bytes.len() && is_space(bytes[pos]) {
            pos += 1;
        }
        if pos >= bytes.len() {
            return OpenTag::Unterminated { attrs };
        }
        if bytes[pos] != b'=' {
            attrs.push((name, String::new()));
            continue;
        }
        pos += 1;
        while pos < bytes.len() && is_space(bytes[pos]) {
            pos += 1;
        }
        if pos >= bytes.len() {
            return OpenTag::Unterminated { attrs };
        }

        let quote = bytes[pos];
        if quote == b'"' || quote == b'\'' {
            let value_start = pos + 1;
            match bytes[value_start..].iter().position(|b| *b == quote) {
                Some(rel) => {
                    attrs.push((name, text[value_start..value_start + rel].to_string()));
                    pos = value_start + rel + 1;
                }
                None => return OpenTag::Unterminated { attrs },
            }
        } else {
            let value_start = pos;
            while pos < bytes.len() && !is_space(bytes[pos]) && bytes[pos] != b'>' {
                pos += 1;
            }
            attrs.push((name, text[value_start..pos].to_string()));
        }
    }
}

// ─── Queries ────────────────────────────────────────────────────────────────

/// Whether the last `<write>` in the text never closes.
pub fn has_unclosed_write(text: &str) -> bool {
    scan(text)
        .iter()
        .rev()
        .find(|t| t.kind == TagKind::Write)
        .is_some_and(|t| !t.complete)
}

/// A complete file-changing directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDirective {
    Write { path: String, content: String },
    Rename { from: String, to: String },
    Delete { path: String },
}

/// Complete write/rename/delete directives, in order.
pub fn file_directives(text: &str) -> Vec<FileDirective> {
    scan(text)
        .into_iter()
        .filter(|t| t.complete)
        .filter_map(|t| match t.kind {
            TagKind::Write => t.attr("path").map(|path| FileDirective::Write {
                path: path.to_string(),
                content: strip_write_body(&t.body),
            }),
            TagKind::Rename => match (t.attr("from"), t.attr("to")) {
                (Some(from), Some(to)) => Some(FileDirective::Rename {
                    from: from.to_string(),
                    to: to.to_string(),
                }),
                _ => None,
            },
            TagKind::Delete => t.attr("path").map(|path| FileDirective::Delete {
                path: path.to_string(),
            }),
            _ => None,
        })
        .collect()
}

/// Drop one leading newline and a single surrounding code fence.
fn strip_write_body(body: &str) -> String {
    let body = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body);

    let trimmed = body.trim();
    if trimmed.starts_with("```") && trimmed.ends_with("```") && trimmed.len() >= 6 {
        if let Some(first_newline) = trimmed.find('\n') {
            let inner = &trimmed[first_newline + 1..trimmed.len() - 3];
            return inner.to_string();
        }
    }
    body.to_string()
}

/// Packages named by complete `<add-dependency>` directives.
pub fn dependency_packages(text: &str) -> Vec<String> {
    scan(text)
        .into_iter()
        .filter(|t| t.complete && t.kind == TagKind::AddDependency)
        .filter_map(|t| t.attr("packages").map(str::to_string))
        .flat_map(|p| {
            p.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// A complete `<tool-call>` tag with its location in the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
    pub start: usize,
    pub end: usize,
}

/// Complete `<tool-call name="...">` tags, in order.
pub fn embedded_tool_calls(text: &str) -> Vec<EmbeddedToolCall> {
    scan(text)
        .into_iter()
        .filter(|t| t.complete && t.kind == TagKind::ToolCall)
        .filter_map(|t| {
            let name = t.attr("name")?.trim().to_string();
            if name.is_empty() {
                return None;
            }
            let raw = t.body.trim();
            let arguments = if raw.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
            };
            Some(EmbeddedToolCall {
                name,
                arguments,
                start: t.start,
                end: t.end,
            })
        })
        .collect()
}

// ─── Escaping ───────────────────────────────────────────────────────────────

/// Replace `<` with a look-alike wherever it would start a known tag.
///
/// A `<` at the end of the input that could still grow into a known tag
/// name is escaped too, since reasoning arrives in fragments.
pub fn escape_tags(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for (i, _) in text.match_indices('<') {
        let mut name_at = i + 1;
        if bytes.get(name_at) == Some(&b'/') {
            name_at += 1;
        }
        let tail = &text[name_at..];
        let starts_tag = match_tag_name(text, name_at, ALL).is_some()
            || ALL.iter().any(|k| k.name().starts_with(tail));
        if starts_tag {
            out.push_str(&text[last..i]);
            out.push(ESCAPED_LT);
            last = i + 1;
        }
    }
    out.push_str(&text[last..]);
    out
}

// ─── Normalization ──────────────────────────────────────────────────────────

/// Idempotent cleanup of transient markers, applied after every update.
///
/// - `</think>` + whitespace + `<think>` collapses to the whitespace
/// - an empty `<think></think>` pair is removed
/// - a `problem-report` block identical to the one right before it is dropped
pub fn normalize(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = dedupe_problem_reports(&remove_empty_think(&merge_think_blocks(&current)));
        if next == current {
            return next;
        }
        current = next;
    }
}

fn merge_think_blocks(text: &str) -> String {
    const CLOSE: &str = "</think>";
    const OPEN: &str = "<think>";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(i) = rest.find(CLOSE) {
        let after = &rest[i + CLOSE.len()..];
        let gap_len = after.len() - after.trim_start().len();
        if after[gap_len..].starts_with(OPEN) {
            out.push_str(&rest[..i]);
            out.push_str(&after[..gap_len]);
            rest = &after[gap_len + OPEN.len()..];
        } else {
            out.push_str(&rest[..i + CLOSE.len()]);
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

fn remove_empty_think(text: &str) -> String {
    const CLOSE: &str = "</think>";
    const OPEN: &str = "<think>";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(i) = rest.find(OPEN) {
        let after = &rest[i + OPEN.len()..];
        let gap_len = after.len() - after.trim_start().len();
        if after[gap_len..].starts_with(CLOSE) {
            out.push_str(&rest[..i]);
            rest = &after[gap_len + CLOSE.len()..];
        } else {
            out.push_str(&rest[..i + OPEN.len()]);
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

fn dedupe_problem_reports(text: &str) -> String {
    let reports: Vec<Tag> = scan(text)
        .into_iter()
        .filter(|t| t.kind == TagKind::ProblemReport && t.complete)
        .collect();

    let mut out = String::with_capacity(text.len());
    let mut copied_to = 0;
    for pair in reports.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let gap = &text[prev.end..cur.start];
        if gap.trim().is_empty() && text[prev.start..prev.end] == text[cur.start..cur.end] {
            out.push_str(&text[copied_to..prev.end]);
            copied_to = cur.end;
        }
    }
    out.push_str(&text[copied_to..]);
    out
}

// ─── Problem-report blocks ──────────────────────────────────────────────────

/// Render a report as a `<problem-report>` block for the buffer.
pub fn problem_report_block(report: &ProblemReport) -> String {
    let summary = match report.len() {
        1 => "1 problem".to_string(),
        n => format!("{n} problems"),
    };
    let mut out = format!("<problem-report summary=\"{summary}\">\n");
    for p in &report.problems {
        out.push_str(&format!(
            "<problem file=\"{}\" line=\"{}\" column=\"{}\" code=\"{}\">{}</problem>\n",
            escape_attr(&p.file),
            p.line,
            p.column,
            escape_attr(&p.code),
            escape_text(&p.message),
        ));
    }
    out.push_str("</problem-report>");
    out
}

/// Read problems back out of a `<problem-report>` tag.
pub fn parse_problem_report(tag: &Tag) -> ProblemReport {
    let problems = scan_kinds(&tag.body, &[TagKind::Problem])
        .into_iter()
        .filter(|t| t.complete)
        .map(|t| crate::agent_core::types::Problem {
            file: unescape(t.attr("file").unwrap_or_default()),
            line: t.attr("line").and_then(|v| v.parse().ok()).unwrap_or(0),
            column: t.attr("column").and_then(|v| v.parse().ok()).unwrap_or(0),
            code: unescape(t.attr("code").unwrap_or_default()),
            message: unescape(&t.body),
            snippet: None,
        })
        .collect();
    ProblemReport { problems }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
}

fn escape_text(value: &str) -> String {
    value.replace('&', "&amp;").replace('<', "&lt;")
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

// ─── Tests ──────────────────────────────────────────────────────────────────

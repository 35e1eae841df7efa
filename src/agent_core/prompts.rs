//! Prompt text: system prompts per chat mode, attachments, fix prompts.

use super::types::{Attachment, ChatMode, ProblemReport};

const BUILD_SYSTEM_PROMPT: &str = r#"You are an expert pair-programmer working inside the user's project.

Answer in concise prose. When you change code, use these tags and nothing else:

<write path="relative/path.ts" description="short summary">
FULL FILE CONTENT
</write>
<rename from="old/path.ts" to="new/path.ts"></rename>
<delete path="relative/path.ts"></delete>
<add-dependency packages="package-a package-b"></add-dependency>

Rules:
- Always write the complete file content inside <write>; never elide sections.
- Close every tag you open.
- Paths are relative to the project root.
- Only add dependencies the code actually imports.

You may call tools to inspect the project before answering. If native tool
calling is unavailable, write <tool-call name="project.read_file">{"path": "src/a.ts"}</tool-call>
and the result will be inserted in its place."#;

const ASK_SYSTEM_PROMPT: &str = r#"You are an expert pair-programmer answering questions about the user's project.

Explain clearly and concisely. You are in read-only mode: do not propose file
changes with <write>, <rename>, <delete> or <add-dependency> tags. Use code
blocks for examples.

You may call tools to inspect the project before answering."#;

/// The system prompt for `mode`, followed by the codebase context.
pub fn system_prompt(mode: ChatMode, codebase_context: &str) -> String {
    let base = match mode {
        ChatMode::Build => BUILD_SYSTEM_PROMPT,
        ChatMode::Ask => ASK_SYSTEM_PROMPT,
    };
    if codebase_context.trim().is_empty() {
        return base.to_string();
    }
    format!("{base}\n\n# Codebase\n\n{codebase_context}")
}

/// Append text attachments to the user's prompt.
pub fn prompt_with_attachments(prompt: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return prompt.to_string();
    }
    let mut out = prompt.to_string();
    for attachment in attachments {
        out.push_str(&format!(
            "\n\n<attachment name=\"{}\">\n{}\n</attachment>",
            attachment.name.replace('"', "'"),
            attachment.content
        ));
    }
    out
}

/// A prompt asking the model to fix every reported problem.
pub fn fix_prompt(report: &ProblemReport) -> String {
    let mut out = format!("Fix these {} problems:\n", report.len());
    for (i, p) in report.problems.iter().enumerate() {
        out.push_str(&format!(
            "\n{}. {}:{}:{} - {} ({})",
            i + 1,
            p.file,
            p.line,
            p.column,
            p.message,
            p.code
        ));
        if let Some(snippet) = p.snippet.as_deref().filter(|s| !s.trim().is_empty()) {
            out.push_str(&format!("\n```\n{snippet}\n```"));
        }
    }
    out.push_str("\n\nPlease fix all errors in a concise way.");
    out
}

//! Static diagnostics over a virtual overlay.
//!
//! [`CommandDiagnostics`] materializes the projected tree into a temporary
//! directory and runs an external checker (e.g. `npx tsc --noEmit`) there,
//! so the real project is never touched.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::overlay::{OverlayEntry, VirtualFileOverlay};
use super::types::{Problem, ProblemReport};

/// Directories never copied into the scratch tree.
const SKIP_DIRS: &[&str] = &[".git", "target", "dist", "build"];

/// Directories linked instead of copied (Unix only; skipped elsewhere).
const LINK_DIRS: &[&str] = &["node_modules"];

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("failed to prepare scratch tree: {reason}")]
    Setup { reason: String },

    #[error("failed to run '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("diagnostics timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Black-box static analyzer.
#[async_trait]
pub trait DiagnosticsProvider: Send + Sync {
    async fn check(
        &self,
        project_root: &Path,
        overlay: &VirtualFileOverlay,
    ) -> Result<ProblemReport, DiagnosticsError>;
}

/// Always reports a clean tree.
pub struct NoDiagnostics;

#[async_trait]
impl DiagnosticsProvider for NoDiagnostics {
    async fn check(
        &self,
        _project_root: &Path,
        _overlay: &VirtualFileOverlay,
    ) -> Result<ProblemReport, DiagnosticsError> {
        Ok(ProblemReport::default())
    }
}

/// Checker command as stored in settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_diagnostics_timeout")]
    pub timeout_secs: u64,
}

fn default_diagnostics_timeout() -> u64 {
    120
}

/// Runs an external command in a scratch copy of the projected tree.
pub struct CommandDiagnostics {
    command: DiagnosticsCommand,
}

impl CommandDiagnostics {
    pub fn new(command: DiagnosticsCommand) -> Self {
        Self { command }
    }

    fn display_command(&self) -> String {
        std::iter::once(self.command.program.as_str())
            .chain(self.command.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl DiagnosticsProvider for CommandDiagnostics {
    async fn check(
        &self,
        project_root: &Path,
        overlay: &VirtualFileOverlay,
    ) -> Result<ProblemReport, DiagnosticsError> {
        let scratch = tempfile::tempdir().map_err(|e| DiagnosticsError::Setup {
            reason: e.to_string(),
        })?;

        let src = project_root.to_path_buf();
        let dest = scratch.path().to_path_buf();
        let projected = overlay.clone();
        tokio::task::spawn_blocking(move || materialize(&src, &dest, &projected))
            .await
            .map_err(|e| DiagnosticsError::Setup {
                reason: e.to_string(),
            })?
            .map_err(|e| DiagnosticsError::Setup {
                reason: e.to_string(),
            })?;

        let started = std::time::Instant::now();
        let child = tokio::process::Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DiagnosticsError::Spawn {
                command: self.display_command(),
                reason: e.to_string(),
            })?;

        let timeout = Duration::from_secs(self.command.timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| DiagnosticsError::Timeout {
                secs: self.command.timeout_secs,
            })?
            .map_err(|e| DiagnosticsError::Spawn {
                command: self.display_command(),
                reason: e.to_string(),
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let mut report = parse_diagnostic_output(&text);
        attach_snippets(&mut report, overlay);

        tracing::info!(
            command = %self.display_command(),
            exit_code = output.status.code().unwrap_or(-1),
            problems = report.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "diagnostics run complete"
        );
        Ok(report)
    }
}

/// Copy `src` into `dest`, then apply the overlay on top.
fn materialize(src: &Path, dest: &Path, overlay: &VirtualFileOverlay) -> std::io::Result<()> {
    copy_tree(src, dest)?;
    for (key, entry) in overlay.entries() {
        let path = dest.join(key);
        match entry {
            OverlayEntry::Content(content) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&path, content)?;
            }
            OverlayEntry::Deleted => {
                if path.is_file() {
                    std::fs::remove_file(&path)?;
                }
            }
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        let file_type = entry.file_type()?;
        let target = dest.join(&name);

        if file_type.is_dir() {
            if SKIP_DIRS.contains(&name_str.as_ref()) {
                continue;
            }
            if LINK_DIRS.contains(&name_str.as_ref()) {
                link_dir(&entry.path(), &target)?;
                continue;
            }
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn link_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dest)
}

#[cfg(not(unix))]
fn link_dir(_src: &Path, _dest: &Path) -> std::io::Result<()> {
    Ok(())
}

// ─── Output parsing ─────────────────────────────────────────────────────────

/// Parse compiler output lines into problems.
///
/// Accepts `file(line,col): error CODE: message` and
/// `file:line:col - error CODE: message`. Other lines are ignored.
pub fn parse_diagnostic_output(output: &str) -> ProblemReport {
    let problems = output
        .lines()
        .filter_map(|line| parse_paren_form(line).or_else(|| parse_dash_form(line)))
        .collect();
    ProblemReport { problems }
}

fn parse_paren_form(line: &str) -> Option<Problem> {
    let (location, rest) = line.split_once("): error ")?;
    let (file, position) = location.rsplit_once('(')?;
    let (line_no, column) = position.split_once(',')?;
    build_problem(file, line_no, column, rest)
}

fn parse_dash_form(line: &str) -> Option<Problem> {
    let (location, rest) = line.split_once(" - error ")?;
    let mut parts = location.rsplitn(3, ':');
    let column = parts.next()?;
    let line_no = parts.next()?;
    let file = parts.next()?;
    build_problem(file, line_no, column, rest)
}

fn build_problem(file: &str, line: &str, column: &str, rest: &str) -> Option<Problem> {
    let (code, message) = rest.split_once(": ")?;
    Some(Problem {
        file: file.trim().trim_start_matches("./").to_string(),
        line: line.trim().parse().ok()?,
        column: column.trim().parse().ok()?,
        code: code.trim().to_string(),
        message: message.trim().to_string(),
        snippet: None,
    })
}

fn attach_snippets(report: &mut ProblemReport, overlay: &VirtualFileOverlay) {
    for problem in &mut report.problems {
        if problem.line == 0 {
            continue;
        }
        problem.snippet = overlay.read(&problem.file).and_then(|content| {
            content
                .lines()
                .nth(problem.line as usize - 1)
                .map(|l| l.trim_end().to_string())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paren_form() {
        let report = parse_diagnostic_output(
            "src/a.ts(3,7): error TS2322: Type 'string' is not assignable to type 'number'.\n\
             Found 1 error.",
        );
        assert_eq!(report.len(), 1);
        let p = &report.problems[0];
        assert_eq!(p.file, "src/a.ts");
        assert_eq!((p.line, p.column), (3, 7));
        assert_eq!(p.code, "TS2322");
        assert!(p.message.starts_with("Type 'string'"));
    }

    #[test]
    fn test_parse_dash_form() {
        let report = parse_diagnostic_output("./src/b.ts:10:2 - error TS2304: Cannot find name 'x'.");
        assert_eq!(report.problems[0].file, "src/b.ts");
        assert_eq!(report.problems[0].line, 10);
        assert_eq!(report.problems[0].code, "TS2304");
    }

    #[test]
    fn test_parse_ignores_noise() {
        let report = parse_diagnostic_output("warning: something\n\nsrc/a.ts(x,1): error TS1: no");
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_no_diagnostics_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = VirtualFileOverlay::new(dir.path());
        let report = NoDiagnostics.check(dir.path(), &overlay).await.unwrap();
        assert!(report.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runs_against_overlay_not_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.ts"), "old\n").unwrap();
        let overlay =
            VirtualFileOverlay::build(dir.path(), "<write path=\"src/a.ts\">NEW line\n</write>");

        let diagnostics = CommandDiagnostics::new(DiagnosticsCommand {
            program: "sh".into(),
            args: vec![
                "-c".into(),
                "grep -q NEW src/a.ts && echo \"src/a.ts(1,1): error T1: saw overlay\"".into(),
            ],
            timeout_secs: 10,
        });
        let report = diagnostics.check(dir.path(), &overlay).await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report.problems[0].snippet.as_deref(), Some("NEW line"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/a.ts")).unwrap(),
            "old\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = VirtualFileOverlay::new(dir.path());
        let diagnostics = CommandDiagnostics::new(DiagnosticsCommand {
            program: "sleep".into(),
            args: vec!["5".into()],
            timeout_secs: 0,
        });
        let err = diagnostics.check(dir.path(), &overlay).await.unwrap_err();
        assert!(matches!(err, DiagnosticsError::Timeout { .. }));
    }
}

//! Structured failure reports
//!
//! [`parse`] turns a panic blob captured from the backend's stderr into a
//! [`DiagnosticReport`]: the panic message, the stack frames with application
//! frames told apart from library ones, and a source snippet around the first
//! application frame. Two trace layouts are understood:
//!
//! ```text
//! 2013/02/12 18:24:15 http: panic serving 127.0.0.1:54114: Panic !!
//! /usr/local/go/src/pkg/net/http/server.go:589 (0x31ed9)
//!     _func_004: buf.Write(debug.Stack())
//! /home/me/app/server.go:16 (0x211e)
//!     Panic: panic(errors.New("Panic !!"))
//! ```
//!
//! and the goroutine layout, where a function line is followed by a
//! tab-indented `path:line +0xoffset` line.

use crate::error::FailureKind;
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::LazyLock;

/// Lines shown in a source snippet, centered on the failing line
pub const SNIPPET_LINES: usize = 13;

/// Banner the Go toolchain prints ahead of errors for a single-file build
const BUILD_BANNER: &str = "# command-line-arguments\n";

// "2013/02/12 18:24:15 http: panic serving 127.0.0.1:54114: "
static SERVING_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".+\d+\.\d+.\d+.\d+:\d+: ").expect("valid serving prefix pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    /// Path as printed, relative to the app root for application frames
    pub file: String,
    pub line: usize,
    pub function: String,
    /// Whether the frame lies under the application root
    pub app: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnippetLine {
    pub number: usize,
    /// HTML-escaped source with whitespace turned into `&nbsp;`
    pub code: String,
    pub current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snippet {
    pub file: String,
    pub lines: Vec<SnippetLine>,
}

/// A failure description handed to a [`crate::page::PageTemplate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticReport {
    pub kind: FailureKind,
    /// Plain text; templates escape it
    pub message: String,
    pub frames: Vec<StackFrame>,
    /// Index into `frames` of the first application frame
    pub app_frame: Option<usize>,
    pub snippet: Option<Snippet>,
}

impl DiagnosticReport {
    /// A report carrying only a message
    pub fn message(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            frames: Vec::new(),
            app_frame: None,
            snippet: None,
        }
    }

    /// A build failure from raw toolchain output
    pub fn build(output: &str) -> Self {
        Self::message(FailureKind::Build, strip_build_banner(output).trim_end())
    }

    pub fn title(&self) -> &'static str {
        self.kind.title()
    }

    pub fn app_frame(&self) -> Option<&StackFrame> {
        self.app_frame.and_then(|i| self.frames.get(i))
    }
}

/// Remove the toolchain banner lines from build output
pub fn strip_build_banner(output: &str) -> String {
    output.replace(BUILD_BANNER, "")
}

/// Parse a captured panic blob. Frames under `root` are application frames;
/// the first one gets a source snippet when its file is readable.
pub fn parse(raw: &str, root: &Path) -> DiagnosticReport {
    let mut message: Vec<&str> = Vec::new();
    let mut frames = Vec::new();
    let mut pending_location: Option<(String, usize)> = None;
    let mut pending_function: Option<String> = None;
    let mut in_trace = false;

    for line in raw.lines() {
        if line.starts_with('/') {
            if let Some((file, number)) = pending_location.take() {
                frames.push(frame(root, file, number, String::new()));
            }
            pending_location = Some(parse_location(line));
            in_trace = true;
            continue;
        }

        if let Some((file, number)) = pending_location.take() {
            frames.push(frame(root, file, number, line.trim().to_string()));
            continue;
        }

        if is_goroutine_header(line) {
            in_trace = true;
            continue;
        }

        if in_trace {
            let trimmed = line.trim_start();
            if line.starts_with(char::is_whitespace) && trimmed.starts_with('/') {
                let (file, number) = parse_location(trimmed);
                let function = pending_function.take().unwrap_or_default();
                frames.push(frame(root, file, number, function));
            } else if !trimmed.is_empty() {
                pending_function = Some(trimmed.to_string());
            }
            continue;
        }

        message.push(line);
    }
    if let Some((file, number)) = pending_location.take() {
        frames.push(frame(root, file, number, String::new()));
    }

    while message.last().is_some_and(|l| l.trim().is_empty()) {
        message.pop();
    }

    let app_frame = frames.iter().position(|f| f.app);
    let snippet = app_frame
        .and_then(|i| frames.get(i))
        .and_then(|f| extract_snippet(root, &f.file, f.line));

    DiagnosticReport {
        kind: FailureKind::Runtime,
        message: panic_message(&message),
        frames,
        app_frame,
        snippet,
    }
}

fn panic_message(lines: &[&str]) -> String {
    let mut lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
    if lines.is_empty() {
        lines.push(String::new());
    }

    lines[0] = SERVING_PREFIX.replace(&lines[0], "").into_owned();
    if !lines[0].contains("runtime error") {
        lines[0] = format!("panic: {}", lines[0]);
    }

    lines.join("\n")
}

fn is_goroutine_header(line: &str) -> bool {
    line.starts_with("goroutine ") && line.trim_end().ends_with("]:")
}

/// `path:line (0x211e)` or `path:line +0x25` into its path and line
fn parse_location(text: &str) -> (String, usize) {
    let location = text.split_whitespace().next().unwrap_or(text);
    match location.rsplit_once(':') {
        Some((path, line)) => match line.parse() {
            Ok(number) => (path.to_string(), number),
            Err(_) => (location.to_string(), 0),
        },
        None => (location.to_string(), 0),
    }
}

fn frame(root: &Path, file: String, line: usize, function: String) -> StackFrame {
    match Path::new(&file).strip_prefix(root) {
        Ok(relative) => StackFrame {
            file: relative.to_string_lossy().into_owned(),
            line,
            function,
            app: true,
        },
        Err(_) => StackFrame {
            file,
            line,
            function,
            app: false,
        },
    }
}

fn extract_snippet(root: &Path, file: &str, current: usize) -> Option<Snippet> {
    if current == 0 {
        return None;
    }
    let content = std::fs::read_to_string(root.join(file)).ok()?;
    let source: Vec<&str> = content.split('\n').collect();

    let half = SNIPPET_LINES / 2;
    let first = current.saturating_sub(half).max(1);
    let last = (current + half).min(source.len());

    let lines = (first..=last)
        .map(|number| SnippetLine {
            number,
            code: snippet_code(source[number - 1]),
            current: number == current,
        })
        .collect();

    Some(Snippet {
        file: file.to_string(),
        lines,
    })
}

fn snippet_code(line: &str) -> String {
    escape_html(line)
        .replace('\t', "&nbsp;&nbsp;&nbsp;&nbsp;")
        .replace(' ', "&nbsp;")
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

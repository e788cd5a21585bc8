//! Diagnostic page rendering

use crate::diagnostic::{escape_html, DiagnosticReport};
use std::fmt::Write;

/// Turns a report into a full HTML document
pub trait PageTemplate: Send + Sync {
    fn render(&self, report: &DiagnosticReport) -> String;
}

/// Built-in page: message, snippet around the failing line, then the trace
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPage;

/// Escape a message and keep its line breaks
pub fn message_html(message: &str) -> String {
    escape_html(message).split('\n').collect::<Vec<_>>().join("<br/>")
}

impl PageTemplate for DefaultPage {
    fn render(&self, report: &DiagnosticReport) -> String {
        let title = report.title();
        let time = chrono::Local::now().format("%H:%M:%S");

        let mut html = String::with_capacity(4096);
        let _ = write!(
            html,
            "{}<title>{}</title>\n<style>{}</style>\n</head>\n<body>\n",
            PAGE_HEAD, title, PAGE_CSS
        );
        let _ = write!(
            html,
            "<header><h1>{}</h1><span class=\"time\">{}</span></header>\n",
            title, time
        );
        let _ = write!(
            html,
            "<section class=\"message\">{}</section>\n",
            message_html(&report.message)
        );

        if let Some(snippet) = &report.snippet {
            let _ = write!(
                html,
                "<section class=\"snippet\">\n<h2>{}</h2>\n<table>\n",
                escape_html(&snippet.file)
            );
            for line in &snippet.lines {
                let class = if line.current { " class=\"current\"" } else { "" };
                let _ = writeln!(
                    html,
                    "<tr{}><td class=\"number\">{}</td><td class=\"code\">{}</td></tr>",
                    class, line.number, line.code
                );
            }
            html.push_str("</table>\n</section>\n");
        }

        if !report.frames.is_empty() {
            html.push_str("<section class=\"trace\">\n<h2>Trace</h2>\n<ul>\n");
            for frame in &report.frames {
                let class = if frame.app { " class=\"app\"" } else { "" };
                let _ = writeln!(
                    html,
                    "<li{}><span class=\"file\">{}:{}</span> <span class=\"function\">{}</span></li>",
                    class,
                    escape_html(&frame.file),
                    frame.line,
                    escape_html(&frame.function)
                );
            }
            html.push_str("</ul>\n</section>\n");
        }

        html.push_str("</body>\n</html>\n");
        html
    }
}

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
"#;

const PAGE_CSS: &str = r#"
body { margin: 0; font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; color: #222; background: #fafafa; }
header { display: flex; justify-content: space-between; align-items: baseline; padding: 16px 24px; background: #b52b27; color: #fff; }
header h1 { margin: 0; font-size: 22px; }
header .time { font-size: 13px; opacity: 0.8; }
section { margin: 16px 24px; }
h2 { font-size: 15px; color: #555; margin: 0 0 8px; }
.message { font-family: Menlo, Consolas, monospace; font-size: 14px; padding: 12px 16px; background: #fff; border-left: 4px solid #b52b27; }
.snippet table { width: 100%; border-collapse: collapse; background: #fff; font-family: Menlo, Consolas, monospace; font-size: 13px; }
.snippet td { padding: 1px 8px; white-space: nowrap; }
.snippet td.number { width: 40px; text-align: right; color: #999; border-right: 1px solid #eee; }
.snippet tr.current { background: #fbe3e4; font-weight: bold; }
.trace ul { list-style: none; padding: 0; margin: 0; font-family: Menlo, Consolas, monospace; font-size: 13px; }
.trace li { padding: 3px 0; color: #999; }
.trace li.app { color: #222; font-weight: bold; }
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{Snippet, SnippetLine, StackFrame};
    use crate::error::FailureKind;

    #[test]
    fn test_message_html() {
        assert_eq!(
            message_html("main.go:3: <nil>\nmain.go:4: oops"),
            "main.go:3: &lt;nil&gt;<br/>main.go:4: oops"
        );
    }

    #[test]
    fn test_render_build_error() {
        let report = DiagnosticReport::build("./main.go:3: syntax error: unexpected }");
        let html = DefaultPage.render(&report);

        assert!(html.contains("<title>Build Error</title>"));
        assert!(html.contains("syntax error: unexpected }"));
        assert!(!html.contains("class=\"trace\""));
    }

    #[test]
    fn test_render_runtime_error_with_snippet() {
        let report = DiagnosticReport {
            kind: FailureKind::Runtime,
            message: "panic: boom".to_string(),
            frames: vec![
                StackFrame {
                    file: "/usr/local/go/src/net/http/server.go".to_string(),
                    line: 589,
                    function: "_func_004: buf.Write(debug.Stack())".to_string(),
                    app: false,
                },
                StackFrame {
                    file: "main.go".to_string(),
                    line: 5,
                    function: "handler: panic(\"boom\")".to_string(),
                    app: true,
                },
            ],
            app_frame: Some(1),
            snippet: Some(Snippet {
                file: "main.go".to_string(),
                lines: vec![
                    SnippetLine {
                        number: 4,
                        code: "func&nbsp;handler()&nbsp;{".to_string(),
                        current: false,
                    },
                    SnippetLine {
                        number: 5,
                        code: "&nbsp;&nbsp;&nbsp;&nbsp;panic(&#34;boom&#34;)".to_string(),
                        current: true,
                    },
                ],
            }),
        };
        let html = DefaultPage.render(&report);

        assert!(html.contains("<h1>Application Error</h1>"));
        assert!(html.contains("panic: boom"));
        assert!(html.contains("<li class=\"app\"><span class=\"file\">main.go:5</span>"));
        assert!(html.contains(
            "<tr class=\"current\"><td class=\"number\">5</td><td class=\"code\">&nbsp;&nbsp;&nbsp;&nbsp;panic(&#34;boom&#34;)</td></tr>"
        ));
    }
}

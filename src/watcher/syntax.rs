//! Syntax checking for tracked sources.
//!
//! `PythonSyntaxChecker` is a small tokenizer plus a block-structure pass that
//! catches the failures a broken edit usually produces (unbalanced brackets,
//! unterminated strings, missing colons, bad indentation) without needing an
//! interpreter. `CommandSyntaxChecker` shells out to a real compiler when one
//! is configured.

use crate::error::{HealError, Result};
use crate::watcher::patterns::{detect_language, Language};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyntaxIssue {
    pub line: usize,
    pub column: Option<usize>,
    pub message: String,
}

impl SyntaxIssue {
    fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column: None,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait SyntaxChecker: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when `source` (the current content of `path`) parses.
    async fn check(&self, path: &Path, source: &str) -> Result<Option<SyntaxIssue>>;
}

pub struct PythonSyntaxChecker;

#[async_trait]
impl SyntaxChecker for PythonSyntaxChecker {
    fn name(&self) -> &str {
        "python-builtin"
    }

    async fn check(&self, _path: &Path, source: &str) -> Result<Option<SyntaxIssue>> {
        Ok(check_python(source))
    }
}

static COMPILER_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"File "[^"]*", line (\d+)"#).expect("valid location regex"));

static PLAIN_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":(\d+):(?:(\d+):)?").expect("valid location regex"));

/// Runs an external command such as `python3 -m py_compile {file}`.
pub struct CommandSyntaxChecker {
    template: Vec<String>,
}

impl CommandSyntaxChecker {
    pub fn new(command: &str) -> Result<Self> {
        let template = shell_words::split(command)
            .map_err(|e| HealError::Configuration(format!("Invalid syntax command: {}", e)))?;
        if template.is_empty() {
            return Err(HealError::Configuration("Empty syntax command".to_string()));
        }
        Ok(Self { template })
    }

    pub fn program(&self) -> &str {
        &self.template[0]
    }

    fn argv_for(&self, path: &Path) -> Vec<String> {
        let file = path.to_string_lossy();
        let mut argv: Vec<String> = self
            .template
            .iter()
            .map(|arg| arg.replace("{file}", &file))
            .collect();
        if !self.template.iter().any(|arg| arg.contains("{file}")) {
            argv.push(file.into_owned());
        }
        argv
    }

    /// Check that the program can be launched at all.
    pub async fn probe(&self) -> Result<()> {
        let status = Command::new(self.program())
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| HealError::Configuration(format!("{}: {}", self.program(), e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(HealError::Configuration(format!(
                "{} --version exited with {}",
                self.program(),
                status
            )))
        }
    }
}

#[async_trait]
impl SyntaxChecker for CommandSyntaxChecker {
    fn name(&self) -> &str {
        self.program()
    }

    async fn check(&self, path: &Path, _source: &str) -> Result<Option<SyntaxIssue>> {
        let argv = self.argv_for(path);
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            return Ok(None);
        }

        let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
        if text.trim().is_empty() {
            text = String::from_utf8_lossy(&output.stdout).into_owned();
        }

        let line = COMPILER_LOCATION
            .captures_iter(&text)
            .last()
            .or_else(|| PLAIN_LOCATION.captures_iter(&text).last())
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(1);

        let message = text
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("syntax check failed")
            .to_string();

        Ok(Some(SyntaxIssue::at(line, message)))
    }
}

/// Picks a checker per file. A probed external command wins for Python files.
pub struct SyntaxRegistry {
    python: PythonSyntaxChecker,
    external: Option<CommandSyntaxChecker>,
}

impl SyntaxRegistry {
    pub fn new(external: Option<CommandSyntaxChecker>) -> Self {
        Self {
            python: PythonSyntaxChecker,
            external,
        }
    }

    pub fn checker_for(&self, path: &Path) -> Option<&dyn SyntaxChecker> {
        match detect_language(path) {
            Language::Python => match &self.external {
                Some(external) => Some(external),
                None => Some(&self.python),
            },
            _ => None,
        }
    }

    /// Check `source` as the content of `path`. Files nobody can check pass.
    pub async fn check(&self, path: &Path, source: &str) -> Result<Option<SyntaxIssue>> {
        match self.checker_for(path) {
            Some(checker) => checker.check(path, source).await,
            None => Ok(None),
        }
    }
}

impl Default for SyntaxRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

// ---------------------------------------------------------------------------
// Python structure check
// ---------------------------------------------------------------------------

const HEADER_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "def", "class", "try", "except", "finally", "with",
];

const STRING_PREFIXES: &[&str] = &[
    "r", "u", "f", "b", "br", "rb", "fr", "rf", "t", "tr", "rt",
];

#[derive(Debug, Clone, PartialEq)]
enum TokKind {
    Name(String),
    /// `:` with its bracket depth
    Colon(usize),
    Other,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokKind,
    line: usize,
}

#[derive(Debug, Default)]
struct LogicalLine {
    start_line: usize,
    indent: usize,
    tokens: Vec<Token>,
}

impl LogicalLine {
    fn first_name(&self) -> Option<&str> {
        match self.tokens.first().map(|t| &t.kind) {
            Some(TokKind::Name(n)) => Some(n.as_str()),
            _ => None,
        }
    }

    /// The compound keyword this line starts with, looking through `async`.
    fn header_keyword(&self) -> Option<&str> {
        let first = self.first_name()?;
        if first == "async" {
            return match self.tokens.get(1).map(|t| &t.kind) {
                Some(TokKind::Name(n)) if matches!(n.as_str(), "def" | "for" | "with") => {
                    Some(n.as_str())
                }
                _ => None,
            };
        }
        HEADER_KEYWORDS.contains(&first).then_some(first)
    }

    fn has_top_colon(&self) -> bool {
        self.tokens.iter().any(|t| t.kind == TokKind::Colon(0))
    }

    fn ends_with_top_colon(&self) -> bool {
        matches!(self.tokens.last().map(|t| &t.kind), Some(TokKind::Colon(0)))
    }

    fn last_line(&self) -> usize {
        self.tokens.last().map(|t| t.line).unwrap_or(self.start_line)
    }
}

struct Lexed {
    lines: Vec<LogicalLine>,
    last_line: usize,
    error: Option<SyntaxIssue>,
}

fn matching_open(close: char) -> char {
    match close {
        ')' => '(',
        ']' => '[',
        _ => '{',
    }
}

fn lex(source: &str) -> Lexed {
    let chars: Vec<char> = source.chars().collect();
    let n = chars.len();
    let mut i = 0;
    let mut line = 1;
    let mut at_line_start = true;
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut lines: Vec<LogicalLine> = Vec::new();
    let mut current: Option<LogicalLine> = None;

    macro_rules! fail {
        ($issue:expr) => {
            return Lexed {
                lines,
                last_line: line,
                error: Some($issue),
            }
        };
    }

    while i < n {
        if at_line_start && stack.is_empty() && current.is_none() {
            let mut col = 0;
            while i < n && matches!(chars[i], ' ' | '\t' | '\x0c') {
                col = match chars[i] {
                    '\t' => (col / 8 + 1) * 8,
                    '\x0c' => 0,
                    _ => col + 1,
                };
                i += 1;
            }
            if i >= n {
                break;
            }
            match chars[i] {
                '\r' => {
                    i += 1;
                    continue;
                }
                '\n' => {
                    line += 1;
                    i += 1;
                    continue;
                }
                '#' => {
                    while i < n && chars[i] != '\n' {
                        i += 1;
                    }
                    continue;
                }
                _ => {
                    current = Some(LogicalLine {
                        start_line: line,
                        indent: col,
                        tokens: Vec::new(),
                    });
                    at_line_start = false;
                    continue;
                }
            }
        }

        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
                if stack.is_empty() {
                    if let Some(done) = current.take() {
                        lines.push(done);
                    }
                    at_line_start = true;
                }
            }
            '\r' | ' ' | '\t' | '\x0c' => i += 1,
            '\\' if matches!(chars.get(i + 1), Some('\n')) => {
                i += 2;
                line += 1;
            }
            '\\' if matches!(chars.get(i + 1), Some('\r')) && matches!(chars.get(i + 2), Some('\n')) => {
                i += 3;
                line += 1;
            }
            '#' => {
                while i < n && chars[i] != '\n' {
                    i += 1;
                }
            }
            '"' | '\'' => {
                let start = line;
                match skip_string(&chars, &mut i, &mut line) {
                    Ok(()) => push(&mut current, TokKind::Other, start, line),
                    Err(issue) => fail!(issue),
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let begin = i;
                while i < n && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[begin..i].iter().collect();
                if i < n
                    && matches!(chars[i], '"' | '\'')
                    && STRING_PREFIXES.contains(&word.to_ascii_lowercase().as_str())
                {
                    let start = line;
                    match skip_string(&chars, &mut i, &mut line) {
                        Ok(()) => push(&mut current, TokKind::Other, start, line),
                        Err(issue) => fail!(issue),
                    }
                } else {
                    push(&mut current, TokKind::Name(word), line, line);
                }
            }
            c if c.is_ascii_digit() => {
                while i < n && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                push(&mut current, TokKind::Other, line, line);
            }
            '(' | '[' | '{' => {
                stack.push((c, line));
                push(&mut current, TokKind::Other, line, line);
                i += 1;
            }
            ')' | ']' | '}' => {
                match stack.pop() {
                    None => fail!(SyntaxIssue::at(line, format!("unmatched '{}'", c))),
                    Some((open, open_line)) if open != matching_open(c) => {
                        let mut msg = format!(
                            "closing parenthesis '{}' does not match opening parenthesis '{}'",
                            c, open
                        );
                        if open_line != line {
                            msg.push_str(&format!(" on line {}", open_line));
                        }
                        fail!(SyntaxIssue::at(line, msg));
                    }
                    Some(_) => {}
                }
                push(&mut current, TokKind::Other, line, line);
                i += 1;
            }
            ':' => {
                if matches!(chars.get(i + 1), Some('=')) {
                    push(&mut current, TokKind::Other, line, line);
                    i += 2;
                } else {
                    push(&mut current, TokKind::Colon(stack.len()), line, line);
                    i += 1;
                }
            }
            _ => {
                push(&mut current, TokKind::Other, line, line);
                i += 1;
            }
        }
    }

    if let Some(&(open, open_line)) = stack.last() {
        fail!(SyntaxIssue::at(open_line, format!("'{}' was never closed", open)));
    }
    if let Some(done) = current.take() {
        lines.push(done);
    }

    Lexed {
        lines,
        last_line: line,
        error: None,
    }
}

fn push(current: &mut Option<LogicalLine>, kind: TokKind, start: usize, end: usize) {
    let logical = current.get_or_insert_with(|| LogicalLine {
        start_line: start,
        indent: 0,
        tokens: Vec::new(),
    });
    logical.tokens.push(Token { kind, line: end });
}

/// Skip a string literal starting at the quote under `i`.
fn skip_string(chars: &[char], i: &mut usize, line: &mut usize) -> std::result::Result<(), SyntaxIssue> {
    let quote = chars[*i];
    let start_line = *line;
    let triple = chars.get(*i + 1) == Some(&quote) && chars.get(*i + 2) == Some(&quote);
    *i += if triple { 3 } else { 1 };

    while *i < chars.len() {
        let c = chars[*i];
        match c {
            '\\' => {
                if chars.get(*i + 1) == Some(&'\n') {
                    *line += 1;
                }
                *i += 2;
            }
            '\n' => {
                if !triple {
                    return Err(SyntaxIssue::at(
                        start_line,
                        format!("unterminated string literal (detected at line {})", start_line),
                    ));
                }
                *line += 1;
                *i += 1;
            }
            c if c == quote => {
                if !triple {
                    *i += 1;
                    return Ok(());
                }
                if chars.get(*i + 1) == Some(&quote) && chars.get(*i + 2) == Some(&quote) {
                    *i += 3;
                    return Ok(());
                }
                *i += 1;
            }
            _ => *i += 1,
        }
    }

    if triple {
        Err(SyntaxIssue::at(
            start_line,
            format!(
                "unterminated triple-quoted string literal (detected at line {})",
                *line
            ),
        ))
    } else {
        Err(SyntaxIssue::at(
            start_line,
            format!("unterminated string literal (detected at line {})", start_line),
        ))
    }
}

fn block_label(keyword: Option<&str>) -> String {
    match keyword {
        Some("def") => "function definition".to_string(),
        Some("class") => "class definition".to_string(),
        Some(kw) => format!("'{}' statement", kw),
        None => "statement".to_string(),
    }
}

fn check_structure(lines: &[LogicalLine], eof_line: Option<usize>) -> Option<SyntaxIssue> {
    let mut indents = vec![0usize];
    let mut pending: Option<(String, usize)> = None;

    for logical in lines {
        let top = *indents.last().unwrap_or(&0);

        if let Some((label, header_line)) = pending.take() {
            if logical.indent > top {
                indents.push(logical.indent);
            } else {
                return Some(SyntaxIssue::at(
                    logical.start_line,
                    format!(
                        "expected an indented block after {} on line {}",
                        label, header_line
                    ),
                ));
            }
        } else if logical.indent > top {
            return Some(SyntaxIssue::at(logical.start_line, "unexpected indent"));
        } else if logical.indent < top {
            while indents.last().is_some_and(|&level| level > logical.indent) {
                indents.pop();
            }
            if indents.last() != Some(&logical.indent) {
                return Some(SyntaxIssue::at(
                    logical.start_line,
                    "unindent does not match any outer indentation level",
                ));
            }
        }

        let keyword = logical.header_keyword();
        if keyword.is_some() && !logical.has_top_colon() {
            return Some(SyntaxIssue::at(logical.last_line(), "expected ':'"));
        }
        if logical.ends_with_top_colon() {
            pending = Some((block_label(keyword), logical.start_line));
        }
    }

    match (pending, eof_line) {
        (Some((label, header_line)), Some(eof)) => Some(SyntaxIssue::at(
            eof,
            format!(
                "expected an indented block after {} on line {}",
                label, header_line
            ),
        )),
        _ => None,
    }
}

/// First syntax problem in a Python source, if any.
pub fn check_python(source: &str) -> Option<SyntaxIssue> {
    let lexed = lex(source);
    match lexed.error {
        Some(lex_error) => check_structure(&lexed.lines, None).or(Some(lex_error)),
        None => {
            let eof = lexed
                .lines
                .last()
                .map(|l| l.last_line() + 1)
                .unwrap_or(lexed.last_line);
            check_structure(&lexed.lines, Some(eof))
        }
    }
}

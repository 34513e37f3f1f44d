//! Terminal Error Display - error screen, candidate preview and operator prompts.

use crate::error::{HealError, Result};
use crate::supervisor::ProcessStatus;
use crate::watcher::healer::HealerStats;
use crate::watcher::patterns::DetectedError;
use crossterm::style::Stylize;
use dialoguer::Input;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;

pub const ERROR_PREVIEW_CHARS: usize = 200;
pub const CANDIDATE_PREVIEW_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Resume,
    Quit,
    Regenerate,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Yes,
    No,
    Details,
}

pub fn parse_command(input: &str) -> Option<OperatorCommand> {
    match input.trim().to_lowercase().as_str() {
        "" | "resume" => Some(OperatorCommand::Resume),
        "q" | "quit" => Some(OperatorCommand::Quit),
        "r" | "regenerate" => Some(OperatorCommand::Regenerate),
        "s" | "status" => Some(OperatorCommand::Status),
        _ => None,
    }
}

pub fn parse_decision(input: &str) -> Option<ApprovalDecision> {
    match input.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalDecision::Yes),
        "n" | "no" => Some(ApprovalDecision::No),
        "d" | "details" => Some(ApprovalDecision::Details),
        _ => None,
    }
}

/// Line-oriented operator input. `Ok(None)` means the input is closed.
pub trait OperatorConsole: Send {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// Reads from the controlling terminal, or plain stdin when it is not a tty.
pub struct TerminalConsole;

impl TerminalConsole {
    fn read_blocking(prompt: &str) -> Result<Option<String>> {
        if io::stdin().is_terminal() {
            let answer: std::result::Result<String, dialoguer::Error> = Input::new()
                .with_prompt(prompt)
                .allow_empty(true)
                .interact_text();
            return match answer {
                Ok(line) => Ok(Some(line)),
                Err(dialoguer::Error::IO(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::UnexpectedEof | io::ErrorKind::Interrupted
                    ) =>
                {
                    Ok(None)
                }
                Err(e) => Err(HealError::from(e)),
            };
        }

        print!("{}: ", prompt);
        io::stdout().flush()?;
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

impl OperatorConsole for TerminalConsole {
    fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        tokio::task::block_in_place(|| Self::read_blocking(prompt))
    }
}

/// Ask until a menu command is given. Closed input counts as quit.
pub fn ask_command(console: &mut dyn OperatorConsole) -> Result<OperatorCommand> {
    loop {
        let Some(input) = console.read_line("Command")? else {
            return Ok(OperatorCommand::Quit);
        };
        match parse_command(&input) {
            Some(command) => return Ok(command),
            None => println!("Unknown command '{}'. Use Enter, r, s or q.", input.trim()),
        }
    }
}

/// Ask until y/n/d is given. Closed input never approves.
pub fn ask_decision(console: &mut dyn OperatorConsole) -> Result<ApprovalDecision> {
    loop {
        let Some(input) = console.read_line("Apply this fix? [y]es / [n]o / [d]etails")? else {
            return Ok(ApprovalDecision::No);
        };
        match parse_decision(&input) {
            Some(decision) => return Ok(decision),
            None => println!("Please answer y, n or d."),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Comment,
    Definition,
    ControlFlow,
    Plain,
}

pub fn classify_line(line: &str) -> LineStyle {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return LineStyle::Comment;
    }
    if ["def ", "class ", "import ", "from "]
        .iter()
        .any(|kw| trimmed.starts_with(kw))
    {
        return LineStyle::Definition;
    }
    if ["if ", "for ", "while ", "try:", "except", "finally:"]
        .iter()
        .any(|kw| trimmed.starts_with(kw))
    {
        return LineStyle::ControlFlow;
    }
    LineStyle::Plain
}

/// Cut `text` to at most `max` characters, marking the cut.
pub fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn styled_line(number: usize, line: &str) -> String {
    let gutter = format!("{:4} │ ", number).dark_grey();
    let body = match classify_line(line) {
        LineStyle::Comment => line.green().to_string(),
        LineStyle::Definition => line.blue().to_string(),
        LineStyle::ControlFlow => line.yellow().to_string(),
        LineStyle::Plain => line.to_string(),
    };
    format!("{}{}", gutter, body)
}

pub fn render_code(code: &str) {
    for (i, line) in code.lines().enumerate() {
        println!("{}", styled_line(i + 1, line));
    }
}

fn clear_screen() {
    let mut stdout = io::stdout();
    if stdout.is_terminal() {
        let _ = crossterm::execute!(
            stdout,
            crossterm::terminal::Clear(crossterm::terminal::ClearType::All),
            crossterm::cursor::MoveTo(0, 0)
        );
    }
}

pub fn render_error_screen(error: &DetectedError, candidate: Option<&str>, paused: bool) {
    clear_screen();
    let rule = "=".repeat(70);
    println!("{}", rule.as_str().red());
    println!("{}", " ERROR DETECTED - servers paused for review".red().bold());
    println!("{}", rule.as_str().red());
    println!("Time:      {}", error.timestamp.format("%Y-%m-%d %H:%M:%S"));
    println!("Kind:      {}", error.kind);
    println!("Severity:  {}", error.severity.to_string().to_uppercase());
    println!("Message:   {}", error.message);
    if let Some(file) = &error.source_file {
        match error.line {
            Some(line) => println!("File:      {}:{}", file.display(), line),
            None => println!("File:      {}", file.display()),
        }
    }
    if let Some(component) = &error.component {
        println!("Component: {}", component);
    }
    if let Some(context) = &error.context {
        println!();
        println!("{}", "Context:".bold());
        for line in context.lines() {
            println!("  {}", line);
        }
    }

    if let Some(candidate) = candidate {
        println!();
        println!("{}", "Proposed fix:".bold());
        render_code(candidate);
    }

    println!();
    if paused {
        println!("{}", "Servers are PAUSED.".yellow());
    } else {
        println!("{}", "Servers are running.".green());
    }
}

pub fn render_menu() {
    println!();
    println!("  [Enter]/resume  resume servers");
    println!("  r/regenerate    ask for a new fix");
    println!("  s/status        show server status");
    println!("  q/quit          stop everything and exit");
}

pub fn render_approval_prompt(file: &Path, error_text: &str, candidate: &str) {
    println!();
    println!("{}", "[HEALER] Permission required to modify a file".cyan().bold());
    println!("File:    {}", file.display());
    println!("Error:   {}", truncate(error_text, ERROR_PREVIEW_CHARS));
    println!("Preview:");
    println!("{}", truncate(candidate, CANDIDATE_PREVIEW_CHARS));
}

pub fn render_details(candidate: &str) {
    println!();
    println!("{}", "Full proposed contents:".bold());
    render_code(candidate);
}

pub fn render_status(statuses: &[ProcessStatus], stats: &HealerStats) {
    println!();
    println!("{}", "Server status".bold());
    for status in statuses {
        let state = match (status.running, status.paused) {
            (true, true) => "PAUSED".yellow(),
            (true, false) => "RUNNING".green(),
            _ => "STOPPED".red(),
        };
        let port = status
            .port
            .map(|p| format!(" port {}", p))
            .unwrap_or_default();
        let pid = status
            .pid
            .map(|p| format!(" pid {}", p))
            .unwrap_or_default();
        println!("  {:<12} {}{}{}", status.name, state, pid, port);
    }
    println!(
        "Errors detected: {}   Fixes applied: {}",
        stats.errors_detected, stats.fixes_applied
    );
    for error in &stats.recent_errors {
        println!(
            "  {} [{}] {}",
            error.timestamp.format("%H:%M:%S"),
            error.severity,
            truncate(&error.message, 80)
        );
    }
}

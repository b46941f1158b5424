use std::fmt::Display;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use console::style;
use devloop_core::OutputLine;

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub const BACKEND_LABEL: &str = "Backend";
pub const FRONTEND_LABEL: &str = "Frontend";

pub fn brand_accent<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).magenta()
}

pub fn brand_secondary<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).blue()
}

pub fn brand_fg<D: Display>(value: D) -> console::StyledObject<D> {
    style(value)
}

pub fn brand_muted<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).dim()
}

pub fn brand_success<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).green()
}

pub fn brand_warning<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).yellow()
}

pub fn brand_error<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).red()
}

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn section(title: &str) {
    println!();
    println!("{}", brand_accent(title).bold());
}

pub fn step(message: &str) {
    println!("{} {}", brand_secondary("•").bold(), brand_fg(message));
}

pub fn success(message: &str) {
    println!("{} {}", brand_success("✓").bold(), brand_fg(message));
}

pub fn warning(message: &str) {
    println!("{} {}", brand_warning("!").bold(), brand_fg(message));
}

pub fn error(message: &str) {
    println!("{} {}", brand_error("✗").bold(), brand_fg(message));
}

pub fn error_stderr(message: &str) {
    eprintln!("{} {}", brand_error("✗").bold(), brand_fg(message));
}

pub fn muted(message: &str) {
    println!("{}", brand_muted(message));
}

fn label_style(label: &str) -> console::StyledObject<String> {
    let tag = format!("[{label}]");
    match label {
        BACKEND_LABEL => brand_secondary(tag),
        FRONTEND_LABEL => brand_warning(tag),
        _ => brand_accent(tag),
    }
}

/// `[Label] text` with trailing whitespace trimmed.
pub fn format_child_line(line: &OutputLine) -> String {
    format!("{} {}", label_style(&line.label), line.text.trim_end())
}

pub fn child_line(line: &OutputLine) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", format_child_line(line));
    let _ = out.flush();
}

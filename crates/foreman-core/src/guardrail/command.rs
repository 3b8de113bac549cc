//! Command safety: the only sanctioned path from a command string to a process.
//!
//! `ensure_allowed_command` rejects anything that is not a single invocation
//! of an allow-listed binary. `ensure_command_safe` rejects destructive
//! invocations and `cd` targets outside the working root. Both are pure over
//! the command string; `run_sanctioned` applies both before spawning.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::thread;

use regex::Regex;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::config::CommandConfig;
use crate::domain::KernelError;

pub const DEFAULT_ALLOWED_BINARIES: &[&str] = &[
    "cargo", "cat", "cd", "chmod", "diff", "echo", "find", "git", "grep", "head", "just", "ls",
    "make", "mkdir", "npm", "pwd", "pytest", "python3", "rg", "rm", "rustc", "tail", "test",
    "touch", "wc",
];

const OUTPUT_LIMIT_BYTES: usize = 100_000;

/// Validates a command against the allow-list and the operator rules.
///
/// Rejects newlines anywhere, and outside quotes: chaining (`&&`, `||`, `|`,
/// `;`), background `&`, command substitution and process substitution.
/// Command substitution is also rejected inside double quotes, where the
/// shell would still expand it. Single-quoted text is literal.
pub fn ensure_allowed_command<S: AsRef<str>>(
    command: &str,
    allowed_binaries: &[S],
) -> Result<(), KernelError> {
    if command.trim().is_empty() {
        return Err(rejected(command, "empty command"));
    }
    if command.contains('\n') || command.contains('\r') {
        return Err(rejected(command, "newline"));
    }
    scan_operators(command).map_err(|reason| rejected(command, reason))?;

    let tokens = shell_words::split(command).map_err(|e| rejected(command, e.to_string()))?;
    let Some(binary) = tokens.first() else {
        return Err(rejected(command, "empty command"));
    };
    if !allowed_binaries.iter().any(|b| b.as_ref() == binary) {
        return Err(rejected(command, format!("binary not allowed: {binary}")));
    }
    Ok(())
}

/// Walks the string tracking quote context and reports the first operator
/// that would make the shell run more than one thing.
fn scan_operators(command: &str) -> Result<(), &'static str> {
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(ch) = chars.next() {
        if in_single {
            if ch == '\'' {
                in_single = false;
            }
            continue;
        }
        if ch == '\\' {
            if chars.next().is_none() {
                return Err("dangling escape");
            }
            continue;
        }
        if in_double {
            match ch {
                '"' => in_double = false,
                '`' => return Err("command substitution"),
                '$' if chars.peek() == Some(&'(') => return Err("command substitution"),
                _ => {}
            }
            continue;
        }
        match ch {
            '\'' => in_single = true,
            '"' => in_double = true,
            ';' => return Err("chaining operator"),
            '|' => return Err("chaining operator"),
            '&' => return Err("chaining operator"),
            '`' => return Err("command substitution"),
            '$' if chars.peek() == Some(&'(') => return Err("command substitution"),
            '<' | '>' if chars.peek() == Some(&'(') => return Err("process substitution"),
            _ => {}
        }
    }
    if in_single || in_double {
        return Err("unterminated quote");
    }
    Ok(())
}

/// Splits a command at unquoted `;`, `|`, `&` operators (so the destructive
/// scan still sees every part of a chained string).
pub fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escape_next = false;

    for ch in command.chars() {
        if escape_next {
            current.push(ch);
            escape_next = false;
            continue;
        }
        if ch == '\\' && !in_single {
            escape_next = true;
            current.push(ch);
            continue;
        }
        if ch == '\'' && !in_double {
            in_single = !in_single;
        } else if ch == '"' && !in_single {
            in_double = !in_double;
        } else if !in_single && !in_double && matches!(ch, ';' | '|' | '&' | '\n') {
            if !current.trim().is_empty() {
                segments.push(current.trim().to_string());
            }
            current.clear();
            continue;
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        segments.push(current.trim().to_string());
    }
    segments
}

struct DestructivePattern {
    name: &'static str,
    matches: fn(&[String]) -> bool,
}

static CHMOD_ESCALATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[0-7]?777|[2-7][0-7]{3}|[ugoa]*\+[rwxX]*s[rwxX]*)$").expect("valid regex")
});

const HOME_OR_ROOT: &[&str] = &[
    "/", "/*", "~", "~/*", "$HOME", "$HOME/*", "${HOME}", "${HOME}/*", "/home", "/root", "/usr",
    "/etc",
];

const DESTRUCTIVE_PATTERNS: &[DestructivePattern] = &[
    DestructivePattern {
        name: "recursive delete of root or home",
        matches: |t| {
            binary_is(t, "rm")
                && has_flag(t, &['r', 'R'], "--recursive")
                && (targets_home_or_root(t) || t.iter().any(|a| a == "--no-preserve-root"))
        },
    },
    DestructivePattern {
        name: "filesystem formatting",
        matches: |t| {
            t.first().is_some_and(|b| {
                let b = binary_name(b);
                b == "mkfs" || b.starts_with("mkfs.") || b == "wipefs" || b == "fdisk"
            })
        },
    },
    DestructivePattern {
        name: "raw device write",
        matches: |t| binary_is(t, "dd") && t.iter().any(|a| a.starts_with("of=/dev/")),
    },
    DestructivePattern {
        name: "privilege escalation",
        matches: |t| binary_is(t, "sudo") || binary_is(t, "su") || binary_is(t, "doas"),
    },
    DestructivePattern {
        name: "ownership change",
        matches: |t| binary_is(t, "chown") || binary_is(t, "chgrp"),
    },
    DestructivePattern {
        name: "permission escalation",
        matches: |t| {
            binary_is(t, "chmod")
                && (t.iter().skip(1).any(|a| CHMOD_ESCALATION.is_match(a))
                    || (has_flag(t, &['R'], "--recursive") && targets_home_or_root(t)))
        },
    },
    DestructivePattern {
        name: "force push",
        matches: |t| {
            git_subcommand(t) == Some("push")
                && (has_flag(t, &['f'], "--force")
                    || t.iter().any(|a| a == "--mirror" || a.starts_with('+')))
        },
    },
    DestructivePattern {
        name: "hard reset",
        matches: |t| git_subcommand(t) == Some("reset") && t.iter().any(|a| a == "--hard"),
    },
    DestructivePattern {
        name: "history rewrite",
        matches: |t| {
            matches!(git_subcommand(t), Some("filter-branch") | Some("filter-repo"))
                || (git_subcommand(t) == Some("update-ref") && t.iter().any(|a| a == "-d"))
        },
    },
];

fn binary_name(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

fn binary_is(tokens: &[String], name: &str) -> bool {
    tokens.first().is_some_and(|b| binary_name(b) == name)
}

/// `long` exactly, or any short-flag group (`-Rf`, `-fu`) holding one of `short`.
fn has_flag(tokens: &[String], short: &[char], long: &str) -> bool {
    tokens.iter().skip(1).any(|a| {
        a == long
            || a
                .strip_prefix('-')
                .filter(|group| !group.starts_with('-'))
                .is_some_and(|group| group.chars().any(|c| short.contains(&c)))
    })
}

fn targets_home_or_root(tokens: &[String]) -> bool {
    tokens
        .iter()
        .skip(1)
        .filter(|a| !a.starts_with('-'))
        .any(|a| HOME_OR_ROOT.contains(&lexical_target(a).as_str()))
}

/// `//`, `/.` and `/home/` compare as `/` and `/home`.
fn lexical_target(arg: &str) -> String {
    if arg.starts_with('/') {
        return normalize(Path::new(arg)).to_string_lossy().into_owned();
    }
    arg.trim_end_matches('/').to_string()
}

fn git_subcommand(tokens: &[String]) -> Option<&str> {
    if !binary_is(tokens, "git") {
        return None;
    }
    let mut args = tokens.iter().skip(1);
    while let Some(arg) = args.next() {
        // Global options that take a value.
        if arg == "-C" || arg == "-c" {
            args.next();
            continue;
        }
        if arg.starts_with('-') {
            continue;
        }
        return Some(arg.as_str());
    }
    None
}

/// Rejects destructive invocations and `cd` targets that leave `root`.
pub fn ensure_command_safe(command: &str, root: &Path) -> Result<(), KernelError> {
    for segment in split_segments(command) {
        let tokens =
            shell_words::split(&segment).map_err(|e| rejected(command, e.to_string()))?;
        if tokens.is_empty() {
            continue;
        }
        if let Some(pattern) = DESTRUCTIVE_PATTERNS.iter().find(|p| (p.matches)(&tokens)) {
            return Err(rejected(command, pattern.name));
        }
        if binary_is(&tokens, "cd") {
            check_cd_target(command, tokens.get(1).map(String::as_str), root)?;
        }
    }
    Ok(())
}

fn check_cd_target(command: &str, target: Option<&str>, root: &Path) -> Result<(), KernelError> {
    let Some(target) = target else {
        return Err(rejected(command, "cd without a target leaves the working root"));
    };
    if target == "-" || target.starts_with('~') || target.contains('$') {
        return Err(rejected(command, "cd target cannot be resolved statically"));
    }
    let root = normalize(root);
    let resolved = normalize(&root.join(target));
    let escapes = resolved
        .components()
        .any(|c| matches!(c, Component::ParentDir));
    if escapes || !resolved.starts_with(&root) {
        return Err(rejected(
            command,
            format!("cd target {} is outside {}", resolved.display(), root.display()),
        ));
    }
    Ok(())
}

/// Lexical normalization: drops `.`, folds `..` into its parent.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last_is_normal = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if last_is_normal {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn rejected(command: &str, reason: impl Into<String>) -> KernelError {
    KernelError::CommandRejected {
        command: command.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }
}

/// Validates `command` with both checks, then runs it in `config.root`
/// without a shell, killing it after `config.timeout()`.
pub fn run_sanctioned(command: &str, config: &CommandConfig) -> Result<CommandOutput, KernelError> {
    ensure_allowed_command(command, &config.allowed_binaries)?;
    ensure_command_safe(command, &config.root)?;

    let tokens = shell_words::split(command).map_err(|e| rejected(command, e.to_string()))?;
    let Some((binary, args)) = tokens.split_first() else {
        return Err(rejected(command, "empty command"));
    };

    debug!(command, root = %config.root.display(), "running sanctioned command");
    let mut child = Command::new(binary)
        .args(args)
        .current_dir(&config.root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| KernelError::io(format!("spawn {binary}"), e))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = thread::spawn(move || read_limited(stdout));
    let stderr_handle = thread::spawn(move || read_limited(stderr));

    let timeout = config.timeout();
    let mut timed_out = false;
    let status = match child
        .wait_timeout(timeout)
        .map_err(|e| KernelError::io(format!("wait {binary}"), e))?
    {
        Some(status) => status,
        None => {
            warn!(command, timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            child
                .kill()
                .map_err(|e| KernelError::io(format!("kill {binary}"), e))?;
            child
                .wait()
                .map_err(|e| KernelError::io(format!("wait {binary}"), e))?
        }
    };

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();
    debug!(command, exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn read_limited<R: Read>(stream: Option<R>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = OUTPUT_LIMIT_BYTES.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

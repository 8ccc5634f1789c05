//! Denylist for caller-supplied and learned remediation commands.
//!
//! A batch is checked in full before anything runs; one match rejects the
//! whole batch. Commands are normalised (whitespace collapsed, backslash
//! escapes removed, substitutions split out) and every chained segment is
//! inspected on its own.

use regex::Regex;
use std::sync::LazyLock;
use tracing::error;

use crate::errors::HealingError;
use crate::observability::telemetry::safe_log_text;

pub const REASON_DISK_WIPE: &str = "disk wipe";
pub const REASON_RECURSIVE_DELETE: &str = "recursive force delete";
pub const REASON_PRIVILEGE_ESCALATION: &str = "privilege escalation";
pub const REASON_PROCESS_TERMINATION: &str = "process or service termination";
pub const REASON_REMOTE_CODE: &str = "remote code execution";
pub const REASON_FORK_BOMB: &str = "fork bomb";

static DANGEROUS_COMMAND_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"\bmkfs(\.[a-z0-9]+)?\b").expect("Invalid regex"),
            REASON_DISK_WIPE,
        ),
        (
            Regex::new(r"\bdd\s+.*\bof=\s*/dev/").expect("Invalid regex"),
            REASON_DISK_WIPE,
        ),
        (
            Regex::new(r">\s*/dev/(sd|hd|nvme|vd|xvd|mmcblk)").expect("Invalid regex"),
            REASON_DISK_WIPE,
        ),
        (
            Regex::new(r"\b(wipefs|shred|blkdiscard)\b").expect("Invalid regex"),
            REASON_DISK_WIPE,
        ),
        (
            Regex::new(r"\bchmod\s+(-[a-z]+\s+)*([ug]\+s|[2467][0-7]{3})\b").expect("Invalid regex"),
            REASON_PRIVILEGE_ESCALATION,
        ),
        (
            Regex::new(r"\bchmod\s+(-[a-z]+\s+)*777\s+/").expect("Invalid regex"),
            REASON_PRIVILEGE_ESCALATION,
        ),
        (
            Regex::new(r"\bchown\s+(-[a-z]+\s+)*root\b").expect("Invalid regex"),
            REASON_PRIVILEGE_ESCALATION,
        ),
        (
            Regex::new(r"/etc/(sudoers|passwd|shadow)").expect("Invalid regex"),
            REASON_PRIVILEGE_ESCALATION,
        ),
        (
            Regex::new(r"\b(curl|wget)\s+[^|]*\|\s*(sh|bash|zsh|ksh|dash)\b").expect("Invalid regex"),
            REASON_REMOTE_CODE,
        ),
        (
            Regex::new(r":\s*\(\s*\)\s*\{.*:\s*\|.*:\s*&.*\}").expect("Invalid regex"),
            REASON_FORK_BOMB,
        ),
    ]
});

const ESCALATION_COMMANDS: &[&str] = &["sudo", "su", "doas", "pkexec", "visudo", "passwd"];
const TERMINATION_COMMANDS: &[&str] = &[
    "kill", "killall", "pkill", "shutdown", "reboot", "halt", "poweroff",
];
const SERVICE_STOP_VERBS: &[&str] = &["stop", "kill", "disable", "mask", "restart", "halt", "poweroff", "reboot"];

/// Collapse whitespace and drop backslash escapes that could reassemble a
/// command name (`r\m` becomes `rm`).
fn normalize(cmd: &str) -> String {
    let mut out = String::with_capacity(cmd.len());
    let mut chars = cmd.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '-' || next == '/' || next == '_' {
                    continue;
                }
            }
        }
        out.push(c);
    }
    out.to_lowercase()
        .replace('`', " ; ")
        .replace("$(", " ; ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split on `;`, `&&`, `||`, `|`, `&` and newlines.
fn segments(normalized: &str) -> Vec<String> {
    normalized
        .split(['\n', ';', '|', '&', ')', '('])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn tokens(segment: &str) -> Vec<String> {
    shlex::split(segment).unwrap_or_else(|| {
        segment
            .split_whitespace()
            .map(str::to_string)
            .collect()
    })
}

const SHELLS: &[&str] = &["sh", "bash", "dash", "zsh", "ksh"];

/// Options of each wrapper program that consume the following token.
fn wrapper_value_options(program: &str) -> Option<&'static [&'static str]> {
    let options: &'static [&'static str] = match program {
        "nohup" | "exec" | "command" | "time" | "busybox" => &[],
        "env" => &["-u", "--unset", "-c", "--chdir"],
        "nice" => &["-n", "--adjustment"],
        "ionice" => &["-c", "-n", "-p", "--class", "--classdata", "--pid"],
        "stdbuf" => &["-i", "-o", "-e", "--input", "--output", "--error"],
        "timeout" => &["-s", "-k", "--signal", "--kill-after"],
        // Tokens are lowercased, so `-I`, `-P`, `-L` and `-E` land here too.
        "xargs" => &[
            "-i", "-n", "-p", "-d", "-l", "-s", "-e", "-a", "--max-args", "--max-procs",
            "--delimiter", "--arg-file",
        ],
        _ => return None,
    };
    Some(options)
}

fn is_assignment(token: &str) -> bool {
    token.contains('=') && !token.starts_with('-') && !token.starts_with('=')
}

/// Index of the program a segment really runs. `VAR=value` prefixes and
/// wrappers such as `env`, `nice -n 10`, `timeout 10`, `xargs` and
/// `busybox` are skipped together with their options.
fn program_index(tokens: &[String]) -> Option<usize> {
    let mut i = 0;
    loop {
        while tokens.get(i).is_some_and(|t| is_assignment(t)) {
            i += 1;
        }
        let program = basename(tokens.get(i)?);
        let Some(value_options) = wrapper_value_options(program) else {
            return Some(i);
        };
        let is_timeout = program == "timeout";
        i += 1;
        while let Some(token) = tokens.get(i) {
            if token == "--" {
                i += 1;
                break;
            }
            if !token.starts_with('-') || token.len() == 1 {
                break;
            }
            i += if value_options.contains(&token.as_str()) { 2 } else { 1 };
        }
        if is_timeout {
            // duration
            i += 1;
        }
    }
}

/// Script handed to a shell with `-c` (also bundled, as in `-ec`).
fn shell_script<'a>(program: &str, args: &'a [String]) -> Option<&'a str> {
    if !SHELLS.contains(&program) {
        return None;
    }
    let flag = args.iter().position(|a| {
        a.starts_with('-') && !a.starts_with("--") && a[1..].contains('c')
    })?;
    args[flag + 1..]
        .iter()
        .find(|a| !a.starts_with('-'))
        .map(String::as_str)
}

fn basename(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

fn is_recursive_force_rm(args: &[String]) -> bool {
    let (mut recursive, mut force) = (false, false);
    for arg in args {
        if arg == "--" {
            break;
        }
        if let Some(long) = arg.strip_prefix("--") {
            recursive |= long == "recursive";
            force |= long == "force";
        } else if let Some(short) = arg.strip_prefix('-') {
            recursive |= short.contains('r');
            force |= short.contains('f');
        }
    }
    recursive && force
}

fn check_segment(segment: &str) -> Option<&'static str> {
    let tokens = tokens(segment);
    let idx = program_index(&tokens)?;
    let program = basename(&tokens[idx]);
    let args = &tokens[idx + 1..];

    if let Some(script) = shell_script(program, args) {
        if let Some(reason) = violation(script) {
            return Some(reason);
        }
    }
    if ESCALATION_COMMANDS.contains(&program) {
        return Some(REASON_PRIVILEGE_ESCALATION);
    }
    if TERMINATION_COMMANDS.contains(&program) {
        return Some(REASON_PROCESS_TERMINATION);
    }
    if program == "init" && args.first().is_some_and(|a| a == "0" || a == "6") {
        return Some(REASON_PROCESS_TERMINATION);
    }
    if program == "systemctl" || program == "service" {
        if args.iter().any(|a| SERVICE_STOP_VERBS.contains(&a.as_str())) {
            return Some(REASON_PROCESS_TERMINATION);
        }
    }
    if program == "rm" && is_recursive_force_rm(args) {
        return Some(REASON_RECURSIVE_DELETE);
    }
    if program == "find" && args.iter().any(|a| a == "-delete") {
        return Some(REASON_RECURSIVE_DELETE);
    }
    None
}

/// Reason a single command is refused, if it is.
pub fn violation(cmd: &str) -> Option<&'static str> {
    let normalized = normalize(cmd);
    for (pattern, reason) in DANGEROUS_COMMAND_PATTERNS.iter() {
        if pattern.is_match(&normalized) {
            return Some(reason);
        }
    }
    segments(&normalized).iter().find_map(|s| check_segment(s))
}

pub fn check_command(cmd: &str) -> Result<(), HealingError> {
    match violation(cmd) {
        Some(reason) => {
            error!(command = %safe_log_text(cmd), reason, "Dangerous command blocked");
            Err(HealingError::UnsafeCommand {
                command: cmd.to_string(),
                reason: reason.to_string(),
            })
        }
        None => Ok(()),
    }
}

/// Validate a whole batch. Nothing may run unless every command passes.
pub fn validate_batch(commands: &[String]) -> Result<(), HealingError> {
    if commands.iter().all(|c| c.trim().is_empty()) {
        return Err(HealingError::NotActionable(
            "empty command batch".to_string(),
        ));
    }
    commands.iter().try_for_each(|c| check_command(c))
}

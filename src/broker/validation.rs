//! Input gate for commands, queries and identifiers.
//!
//! Every shell command and every SQL identifier passes through here before it
//! reaches a live connection. The shell deny-list is defense in depth against
//! obviously destructive commands, not a sandbox: anything it does not match is
//! allowed.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::config::ValidationLimits;
use super::error::{BrokerError, Result};

const MAX_PROFILE_NAME_LENGTH: usize = 64;
const MAX_HOST_LENGTH: usize = 253;

/// Deny-list patterns and the label reported when one matches.
const DENY_PATTERNS: &[(&str, &str)] = &[
    // Disk wiping
    (
        r"\brm\s+(?:-\S+\s+)*(?:-[A-Za-z]*[rR][A-Za-z]*|--recursive)\s+(?:-\S+\s+)*(?:/\*?|~/?|\$HOME/?)(?:\s|;|&|\||$)",
        "recursive delete of a root or home directory",
    ),
    (
        r"(?i)\bdd\b.*\bof=/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk)",
        "raw write to a block device",
    ),
    (r"(?i)\bshred\b.*\s/dev/", "shredding a device"),
    (
        r"(?i)>\s*/dev/(?:sd|hd|vd|xvd|nvme|mmcblk|disk)",
        "redirect onto a block device",
    ),
    // Filesystem formatting
    (r"(?i)\bmkfs(?:\.\w+)?\b", "filesystem formatting"),
    (
        r"(?i)\b(?:fdisk|sfdisk|parted|wipefs)\b",
        "partition table manipulation",
    ),
    // Services and firewall
    (
        r"(?i)\bsystemctl\s+(?:\S+\s+)*(?:stop|disable|mask)\b",
        "stopping or disabling a service",
    ),
    (r"(?i)\bservice\s+\S+\s+stop\b", "stopping a service"),
    (
        r"\biptables\s+(?:\S+\s+)*(?:-F|-X|--flush)\b",
        "flushing firewall rules",
    ),
    (r"(?i)\bufw\s+disable\b", "disabling the firewall"),
    (r"(?i)\bnft\s+flush\b", "flushing firewall rules"),
    // Shutdown and reboot
    (
        r"(?i)\b(?:shutdown|reboot|halt|poweroff)\b",
        "shutdown or reboot",
    ),
    (r"\binit\s+[06]\b", "runlevel change to halt or reboot"),
    // Credential files
    (r"/etc/shadow\b", "access to the shadow password file"),
    (r"/etc/sudoers\b", "access to sudoers"),
    (
        r"(?:>\s*|\btee\b[^|;&]*\s|\bsed\s+-i\b[^|;&]*\s|\b(?:cp|mv)\b[^|;&]*\s)/etc/passwd\b",
        "writing the passwd file",
    ),
    (
        r"(?:~|\$HOME|/root|/home/[^/\s]+)/\.ssh/id_[A-Za-z0-9_]+(?:\s|;|&|\||>|$)",
        "access to an SSH private key",
    ),
    // Mass process kill
    (r"\bkill\s+-(?:9|KILL|SIGKILL)\s+-1\b", "killing every process"),
    (r"\bkillall5\b", "killing every process"),
    (r"\bpkill\s+-9\s+\.", "killing every process"),
    // Fork bomb
    (
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb",
    ),
    // Permission blasting
    (
        r"\bchmod\s+(?:-\S+\s+)*-[A-Za-z]*R[A-Za-z]*\s+(?:-\S+\s+)*0?777\s+/(?:\s|;|&|\||$)",
        "recursive chmod 777 of the root directory",
    ),
    (
        r"\bchown\s+(?:-\S+\s+)*-[A-Za-z]*R[A-Za-z]*\s+(?:-\S+\s+)*\S+\s+/(?:\s|;|&|\||$)",
        "recursive chown of the root directory",
    ),
];

static DENY_LIST: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    DENY_PATTERNS
        .iter()
        .filter_map(|(pattern, label)| Regex::new(pattern).ok().map(|re| (re, *label)))
        .collect()
});

static IDENTIFIER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

static READ_ONLY: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^\s*\(?\s*(?:select|with)\b").ok());

fn is_match(re: &Lazy<Option<Regex>>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

/// Length-bounded checks for caller input.
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    limits: ValidationLimits,
}

impl Validator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ValidationLimits {
        self.limits
    }

    /// Accepts a bare SQL identifier (`[A-Za-z_][A-Za-z0-9_]*`) within the length limit.
    pub fn ensure_identifier<'a>(&self, name: &'a str) -> Result<&'a str> {
        if name.len() > self.limits.max_identifier_length || !is_match(&IDENTIFIER, name) {
            warn!(kind = "invalid_identifier", len = name.len(), "Rejected identifier");
            return Err(BrokerError::InvalidIdentifier(name.to_string()));
        }
        Ok(name)
    }

    /// Trims a shell command and rejects empty, oversized or deny-listed input.
    pub fn ensure_command(&self, raw: &str) -> Result<String> {
        let command = raw.trim();
        if command.is_empty() {
            warn!(kind = "empty_command", "Rejected command");
            return Err(BrokerError::EmptyCommand);
        }
        if command.len() > self.limits.max_command_length {
            warn!(
                kind = "command_too_long",
                len = command.len(),
                max = self.limits.max_command_length,
                "Rejected command"
            );
            return Err(BrokerError::CommandTooLong {
                len: command.len(),
                max: self.limits.max_command_length,
            });
        }
        if command.contains('\0') {
            warn!(kind = "nul_byte", "Rejected command");
            return Err(BrokerError::InvalidInput(
                "command contains a NUL byte".to_string(),
            ));
        }
        if let Some((_, label)) = DENY_LIST.iter().find(|(re, _)| re.is_match(command)) {
            warn!(kind = "dangerous_operation", rule = *label, "Rejected command");
            return Err(BrokerError::DangerousOperation((*label).to_string()));
        }
        Ok(command.to_string())
    }

    /// Trims caller SQL and rejects empty or oversized statements, and
    /// UPDATE or DELETE statements without a top-level WHERE clause.
    ///
    /// The shell deny-list does not apply; statements run with the profile's
    /// database privileges.
    pub fn ensure_statement(&self, raw: &str) -> Result<String> {
        let statement = raw.trim();
        if statement.is_empty() {
            warn!(kind = "empty_statement", "Rejected statement");
            return Err(BrokerError::EmptyCommand);
        }
        if statement.len() > self.limits.max_command_length {
            warn!(
                kind = "statement_too_long",
                len = statement.len(),
                max = self.limits.max_command_length,
                "Rejected statement"
            );
            return Err(BrokerError::CommandTooLong {
                len: statement.len(),
                max: self.limits.max_command_length,
            });
        }
        if statement.contains('\0') {
            warn!(kind = "nul_byte", "Rejected statement");
            return Err(BrokerError::InvalidInput(
                "statement contains a NUL byte".to_string(),
            ));
        }
        ensure_guarded_writes(statement)?;
        Ok(statement.to_string())
    }
}

/// Requires a non-blank WHERE clause for `operation` (UPDATE or DELETE).
pub fn ensure_where_clause<'a>(text: &'a str, operation: &'static str) -> Result<&'a str> {
    if text.trim().is_empty() {
        warn!(kind = "missing_where_clause", operation, "Rejected statement");
        return Err(BrokerError::MissingWhereClause(operation));
    }
    Ok(text)
}

/// Profile names: 1-64 characters from `[A-Za-z0-9_.-]`.
pub fn ensure_profile_name(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name.len() <= MAX_PROFILE_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        warn!(kind = "invalid_profile_name", "Rejected profile name");
        return Err(BrokerError::InvalidInput(format!(
            "profile name '{}' must be 1-{} characters of letters, digits, '_', '.' or '-'",
            name, MAX_PROFILE_NAME_LENGTH
        )));
    }
    Ok(name)
}

/// Hostnames, IPv4 and IPv6 literals. No whitespace or shell metacharacters.
pub fn ensure_host(host: &str) -> Result<&str> {
    let host = host.trim();
    let valid = !host.is_empty()
        && host.len() <= MAX_HOST_LENGTH
        && !host.starts_with('-')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'));
    if !valid {
        warn!(kind = "invalid_host", "Rejected host");
        return Err(BrokerError::InvalidInput(format!("invalid host '{}'", host)));
    }
    Ok(host)
}

/// Usernames must be non-empty and free of whitespace and control characters.
pub fn ensure_username(username: &str) -> Result<&str> {
    let username = username.trim();
    if username.is_empty()
        || username
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
    {
        warn!(kind = "invalid_username", "Rejected username");
        return Err(BrokerError::InvalidInput(
            "username must be non-empty without whitespace".to_string(),
        ));
    }
    Ok(username)
}

/// SQL text with comments blanked out, and the lowercased words (plus `;`)
/// found outside parentheses, quotes and comments.
struct ScannedSql {
    code: String,
    top_level: Vec<String>,
}

impl ScannedSql {
    fn statements(&self) -> impl Iterator<Item = &[String]> {
        self.top_level
            .split(|word| word == ";")
            .filter(|words| !words.is_empty())
    }

    fn has_top_level(&self, word: &str) -> bool {
        self.top_level.iter().any(|w| w == word)
    }
}

/// Index just past the `$tag$` opening at `start`, if there is one.
fn dollar_tag_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }
    while let Some(&c) = chars.get(i) {
        if c == '$' {
            return Some(i + 1);
        }
        if !(c.is_alphanumeric() || c == '_') {
            return None;
        }
        i += 1;
    }
    None
}

fn scan_sql(sql: &str) -> ScannedSql {
    let chars: Vec<char> = sql.chars().collect();
    let mut code = String::with_capacity(sql.len());
    let mut top_level = Vec::new();
    let mut word = String::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let is_word = c.is_alphanumeric() || c == '_';
        if !is_word && !word.is_empty() {
            let done = std::mem::take(&mut word);
            if depth == 0 {
                top_level.push(done.to_lowercase());
            }
        }

        match (c, chars.get(i + 1).copied()) {
            ('-', Some('-')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                code.push(' ');
                continue;
            }
            ('/', Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
                code.push(' ');
                continue;
            }
            ('\'', _) | ('"', _) => {
                let mut end = i + 1;
                while end < chars.len() && chars[end] != c {
                    end += 1;
                }
                end = (end + 1).min(chars.len());
                code.extend(&chars[i..end]);
                i = end;
                continue;
            }
            ('$', _) => {
                if let Some(tag_end) = dollar_tag_end(&chars, i) {
                    let tag = &chars[i..tag_end];
                    let mut end = tag_end;
                    while end < chars.len() && !chars[end..].starts_with(tag) {
                        end += 1;
                    }
                    end = (end + tag.len()).min(chars.len());
                    code.extend(&chars[i..end]);
                    i = end;
                    continue;
                }
            }
            ('(', _) => depth += 1,
            (')', _) => depth = depth.saturating_sub(1),
            (';', _) if depth == 0 => top_level.push(";".to_string()),
            _ => {}
        }

        if is_word {
            word.push(c);
        }
        code.push(c);
        i += 1;
    }
    if !word.is_empty() && depth == 0 {
        top_level.push(word.to_lowercase());
    }

    ScannedSql { code, top_level }
}

/// Rejects UPDATE and DELETE statements without a top-level WHERE clause.
///
/// Statements led by `WITH` are judged by their main verb.
pub fn ensure_guarded_writes(sql: &str) -> Result<()> {
    let scanned = scan_sql(sql);
    for words in scanned.statements() {
        let verb = match words.first().map(String::as_str) {
            Some("with") => words
                .iter()
                .map(String::as_str)
                .find(|w| matches!(*w, "select" | "insert" | "update" | "delete")),
            first => first,
        };
        let operation = match verb {
            Some("update") => "UPDATE",
            Some("delete") => "DELETE",
            _ => continue,
        };
        if !words.iter().any(|w| w == "where") {
            warn!(kind = "missing_where_clause", operation, "Rejected statement");
            return Err(BrokerError::MissingWhereClause(operation));
        }
    }
    Ok(())
}

/// `SELECT ...` or `WITH ...`, optionally parenthesised, after leading comments.
pub fn is_read_only_query(sql: &str) -> bool {
    is_match(&READ_ONLY, &scan_sql(sql).code)
}

/// Appends `LIMIT n` to a read-only query without a top-level LIMIT or FETCH.
///
/// Caps inside subqueries and CTEs do not count. Comments are dropped from a
/// decorated query so the cap cannot end up inside one.
pub fn decorate_select(sql: &str, limit: u64) -> String {
    let trimmed = sql.trim();
    let scanned = scan_sql(trimmed);
    if !is_match(&READ_ONLY, &scanned.code)
        || scanned.has_top_level("limit")
        || scanned.has_top_level("fetch")
    {
        return trimmed.to_string();
    }
    let body = scanned.code.trim().trim_end_matches(';').trim_end();
    format!("{} LIMIT {}", body, limit)
}

/// Postgres double-quoting for an identifier that already passed `ensure_identifier`.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

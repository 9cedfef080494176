//! Static risk analyzer for shell commands and scripts.
//!
//! Performs line-based pattern matching augmented with path analysis. The
//! matching is deliberately lexical and conservative: a dangerous pattern is
//! reported even when it appears inside quotes or behind escapes, and a
//! trailing `# comment` never disables detection. False positives are
//! preferred over false negatives.

use crate::config::{PolicyConfig, ProductionIndicators};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

/// Severity classes, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Stable finding identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingCode {
    DangerousDeleteRoot,
    DangerousDeleteHome,
    ForkBomb,
    PipeToShell,
    SudoUnrestricted,
    ForceGitPush,
    DestructiveSql,
    ProdEnvTouch,
    DotenvFileRead,
    SensitiveEnvAccess,
    DeviceWrite,
    PolicyDenylist,
    PolicyAllowlist,
    GitOperation,
}

impl std::fmt::Display for FindingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FindingCode::DangerousDeleteRoot => "DANGEROUS_DELETE_ROOT",
            FindingCode::DangerousDeleteHome => "DANGEROUS_DELETE_HOME",
            FindingCode::ForkBomb => "FORK_BOMB",
            FindingCode::PipeToShell => "PIPE_TO_SHELL",
            FindingCode::SudoUnrestricted => "SUDO_UNRESTRICTED",
            FindingCode::ForceGitPush => "FORCE_GIT_PUSH",
            FindingCode::DestructiveSql => "DESTRUCTIVE_SQL",
            FindingCode::ProdEnvTouch => "PROD_ENV_TOUCH",
            FindingCode::DotenvFileRead => "DOTENV_FILE_READ",
            FindingCode::SensitiveEnvAccess => "SENSITIVE_ENV_ACCESS",
            FindingCode::DeviceWrite => "DEVICE_WRITE",
            FindingCode::PolicyDenylist => "POLICY_DENYLIST",
            FindingCode::PolicyAllowlist => "POLICY_ALLOWLIST",
            FindingCode::GitOperation => "GIT_OPERATION",
        };
        write!(f, "{s}")
    }
}

/// A single detected risk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub code: FindingCode,
    pub severity: Severity,
    pub description: String,
    pub recommendation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl Finding {
    fn new(
        code: FindingCode,
        severity: Severity,
        description: impl Into<String>,
        recommendation: impl Into<String>,
        line: usize,
        snippet: &str,
    ) -> Self {
        Finding {
            code,
            severity,
            description: description.into(),
            recommendation: recommendation.into(),
            line: Some(line),
            snippet: Some(truncate_snippet(snippet)),
        }
    }
}

/// The overall risk level of a command is the maximum finding severity;
/// no findings means low.
pub fn risk_level(findings: &[Finding]) -> Severity {
    findings
        .iter()
        .map(|f| f.severity)
        .max()
        .unwrap_or(Severity::Low)
}

fn truncate_snippet(line: &str) -> String {
    const MAX: usize = 200;
    let trimmed = line.trim();
    if trimmed.len() <= MAX {
        trimmed.to_string()
    } else {
        let mut cut = MAX;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &trimmed[..cut])
    }
}

// ---------------------------------------------------------------------------
// Pattern tables
// ---------------------------------------------------------------------------

static PIPE_TO_SHELL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(sh|bash|zsh|\$SHELL)\b").unwrap()
});

static SUDO_INVOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[;&|(]\s*)sudo\b").unwrap());

static GIT_PUSH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bgit\s+push\b").unwrap());

static SQL_DROP_DATABASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdrop\s+database\b").unwrap());
static SQL_TRUNCATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btruncate\b").unwrap());
static SQL_DELETE_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdelete\s+from\b").unwrap());
static SQL_WHERE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bwhere\b").unwrap());

static DOTENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(^|[\s/=:'"])\.env(\.[A-Za-z0-9_.-]+)?($|[\s'");])"#).unwrap()
});

static SENSITIVE_ENV_EXPANSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\$\{?[A-Z0-9_]*(TOKEN|SECRET|KEY|PASSWORD)[A-Z0-9_]*\}?").unwrap()
});
static SENSITIVE_ENV_PRINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(printenv|echo)\s+\S*(TOKEN|SECRET|KEY|PASSWORD)").unwrap()
});

static DD_DEVICE_WRITE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bdd\b[^|;]*\bof=["']?/dev/"#).unwrap());
static MKFS_DEVICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bmkfs(\.[a-z0-9]+)?\b.*\s['\x22]?/dev/").unwrap());

static GIT_MUTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bgit\s+(push|reset\s+--hard|clean\b.*-[a-z]*f|branch\s+-D|stash\s+(drop|clear))")
        .unwrap()
});

/// Filesystem roots whose recursive deletion is always critical.
const CRITICAL_DELETE_PREFIXES: &[&str] = &[
    "/bin", "/boot", "/etc", "/lib", "/proc", "/sbin", "/sys", "/usr", "/var",
];

/// Home-directory spellings whose recursive deletion is high severity.
const HOME_DELETE_TARGETS: &[&str] = &[
    "~", "~/", "~/*", "$HOME", "$HOME/*", "${HOME}", "${HOME}/*",
];

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Analyze a script or inline command and return the ordered findings.
///
/// Lines are processed in source order; within a line, matchers run in a
/// fixed order and duplicate (code, line) pairs are suppressed. Malformed
/// input yields zero findings, never an error.
pub fn analyze_script(
    name: &str,
    content: &[u8],
    policies: &PolicyConfig,
    indicators: &ProductionIndicators,
) -> Vec<Finding> {
    let text = String::from_utf8_lossy(content);
    let mut findings = Vec::new();
    let mut seen: HashSet<(FindingCode, usize)> = HashSet::new();

    tracing::debug!(source = name, bytes = content.len(), "analyzing script");

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut emit = |f: Finding| {
            let key = (f.code, line_no);
            if seen.insert(key) {
                findings.push(f);
            }
        };

        check_dangerous_delete(line, line_no, &mut emit);
        check_fork_bomb(line, line_no, &mut emit);
        check_pipe_to_shell(line, line_no, &mut emit);
        check_sudo(line, line_no, &mut emit);
        if policies.block_force_git {
            check_force_git_push(line, line_no, &mut emit);
        }
        check_destructive_sql(line, line_no, policies.only_destructive_sql, &mut emit);
        if policies.detect_prod_env {
            check_prod_env(line, line_no, indicators, &mut emit);
        }
        check_dotenv_read(line, line_no, &mut emit);
        check_sensitive_env(line, line_no, &mut emit);
        check_device_write(line, line_no, &mut emit);
        if policies.matches_denylist(line) {
            emit(Finding::new(
                FindingCode::PolicyDenylist,
                Severity::Critical,
                "command matches a denylist pattern",
                "remove the command or amend the policy denylist",
                line_no,
                line,
            ));
        }
        if policies.matches_allowlist(line) {
            emit(Finding::new(
                FindingCode::PolicyAllowlist,
                Severity::Low,
                "command matches an allowlist pattern",
                "no action needed",
                line_no,
                line,
            ));
        }
        if policies.monitor_git_ops {
            check_git_operation(line, line_no, &mut emit);
        }
    }

    findings
}

// ---------------------------------------------------------------------------
// Matchers, one per finding code
// ---------------------------------------------------------------------------

/// Recursive deletion of the filesystem root or of critical system paths,
/// and recursive deletion of the home directory.
fn check_dangerous_delete(line: &str, line_no: usize, emit: &mut impl FnMut(Finding)) {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(rm_idx) = tokens
        .iter()
        .position(|t| *t == "rm" || t.ends_with("/rm"))
    else {
        return;
    };

    let rest = &tokens[rm_idx + 1..];
    let recursive = rest.iter().any(|t| {
        *t == "--recursive"
            || (t.starts_with('-') && !t.starts_with("--") && t.contains('r'))
    });
    let no_preserve_root = rest.iter().any(|t| *t == "--no-preserve-root");

    if !recursive && !no_preserve_root {
        return;
    }

    if no_preserve_root {
        emit(Finding::new(
            FindingCode::DangerousDeleteRoot,
            Severity::Critical,
            "rm invoked with --no-preserve-root",
            "never disable the root-preservation guard",
            line_no,
            line,
        ));
    }

    let targets: Vec<&str> = rest
        .iter()
        .filter(|t| !t.starts_with('-'))
        .map(|t| t.trim_matches(|c| c == '"' || c == '\''))
        .collect();

    // `rm -rf / *` splits into two targets; the bare "/" already classifies
    // the line as a root deletion.
    for target in &targets {
        let t = target.trim();
        if t == "/" || t == "/*" {
            emit(Finding::new(
                FindingCode::DangerousDeleteRoot,
                Severity::Critical,
                "recursive deletion targets the filesystem root",
                "specify an explicit subdirectory instead of /",
                line_no,
                line,
            ));
            continue;
        }
        if CRITICAL_DELETE_PREFIXES
            .iter()
            .any(|p| t == *p || t.starts_with(&format!("{p}/")))
        {
            emit(Finding::new(
                FindingCode::DangerousDeleteRoot,
                Severity::Critical,
                format!("recursive deletion targets system path {t}"),
                "system directories must not be removed",
                line_no,
                line,
            ));
            continue;
        }
        if HOME_DELETE_TARGETS.contains(&t) {
            emit(Finding::new(
                FindingCode::DangerousDeleteHome,
                Severity::High,
                "recursive deletion targets the home directory",
                "delete a specific project directory instead",
                line_no,
                line,
            ));
        }
    }
}

/// A fork bomb has the shape `NAME(){ NAME|NAME& };NAME` for any function
/// name, whitespace-insensitively.
fn check_fork_bomb(line: &str, line_no: usize, emit: &mut impl FnMut(Finding)) {
    if is_fork_bomb(line) {
        emit(Finding::new(
            FindingCode::ForkBomb,
            Severity::Critical,
            "self-replicating function exhausts the process table",
            "do not run fork bombs",
            line_no,
            line,
        ));
    }
}

fn is_fork_bomb(line: &str) -> bool {
    let collapsed: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    let Some(open) = collapsed.find("(){") else {
        return false;
    };
    // The function name is the trailing identifier run before "(){".
    let name_start = collapsed[..open]
        .rfind(|c: char| "(){}|&;".contains(c))
        .map(|i| i + 1)
        .unwrap_or(0);
    let name = &collapsed[name_start..open];
    if name.is_empty() {
        return false;
    }
    let expected = format!("{name}(){{{name}|{name}&}};{name}");
    collapsed[name_start..].starts_with(&expected)
}

/// A pipeline that fetches from the network and feeds the result to a shell.
fn check_pipe_to_shell(line: &str, line_no: usize, emit: &mut impl FnMut(Finding)) {
    if PIPE_TO_SHELL.is_match(line) {
        emit(Finding::new(
            FindingCode::PipeToShell,
            Severity::High,
            "network download piped directly into a shell",
            "download to a file, inspect it, then run it",
            line_no,
            line,
        ));
    }
}

fn check_sudo(line: &str, line_no: usize, emit: &mut impl FnMut(Finding)) {
    if SUDO_INVOCATION.is_match(line) {
        emit(Finding::new(
            FindingCode::SudoUnrestricted,
            Severity::Medium,
            "sudo invocation not restricted by policy",
            "restrict sudo to specific commands in the policy allowlist",
            line_no,
            line,
        ));
    }
}

/// `git push --force` / `-f` (token match, so --force-with-lease is exempt).
fn check_force_git_push(line: &str, line_no: usize, emit: &mut impl FnMut(Finding)) {
    if !GIT_PUSH.is_match(line) {
        return;
    }
    let forced = line
        .split_whitespace()
        .any(|t| t == "--force" || t == "-f");
    if forced {
        emit(Finding::new(
            FindingCode::ForceGitPush,
            Severity::High,
            "force push rewrites remote history",
            "use --force-with-lease, or coordinate with the branch owners",
            line_no,
            line,
        ));
    }
}

/// DROP DATABASE and TRUNCATE always fire; DELETE FROM fires without a WHERE
/// clause, and with one only when only_destructive_sql is disabled.
fn check_destructive_sql(
    line: &str,
    line_no: usize,
    only_destructive: bool,
    emit: &mut impl FnMut(Finding),
) {
    let mut hit: Option<&str> = None;
    if SQL_DROP_DATABASE.is_match(line) {
        hit = Some("DROP DATABASE discards the entire database");
    } else if SQL_TRUNCATE.is_match(line) {
        hit = Some("TRUNCATE discards all rows without logging");
    } else if SQL_DELETE_FROM.is_match(line) {
        let has_where = SQL_WHERE.is_match(line);
        if !has_where {
            hit = Some("DELETE FROM without a WHERE clause removes every row");
        } else if !only_destructive {
            hit = Some("DELETE FROM statement detected");
        }
    }
    if let Some(description) = hit {
        emit(Finding::new(
            FindingCode::DestructiveSql,
            Severity::High,
            description,
            "run destructive SQL against a staging copy first",
            line_no,
            line,
        ));
    }
}

/// Case-insensitive mention of a production keyword, or a git push that
/// names a production branch.
fn check_prod_env(
    line: &str,
    line_no: usize,
    indicators: &ProductionIndicators,
    emit: &mut impl FnMut(Finding),
) {
    let lower = line.to_lowercase();
    let keyword_hit = indicators
        .keywords
        .iter()
        .any(|kw| !kw.is_empty() && lower.contains(&kw.to_lowercase()));
    let branch_hit = GIT_PUSH.is_match(line)
        && indicators
            .branches
            .iter()
            .any(|b| !b.is_empty() && lower.split_whitespace().any(|t| t == b.to_lowercase()));
    if keyword_hit || branch_hit {
        emit(Finding::new(
            FindingCode::ProdEnvTouch,
            Severity::Medium,
            "command references a production environment",
            "double-check the target environment before running",
            line_no,
            line,
        ));
    }
}

fn check_dotenv_read(line: &str, line_no: usize, emit: &mut impl FnMut(Finding)) {
    if DOTENV_REFERENCE.is_match(line) {
        emit(Finding::new(
            FindingCode::DotenvFileRead,
            Severity::High,
            "access to a .env secrets file",
            "keep .env files out of command lines and logs",
            line_no,
            line,
        ));
    }
}

fn check_sensitive_env(line: &str, line_no: usize, emit: &mut impl FnMut(Finding)) {
    if SENSITIVE_ENV_EXPANSION.is_match(line) || SENSITIVE_ENV_PRINT.is_match(line) {
        emit(Finding::new(
            FindingCode::SensitiveEnvAccess,
            Severity::High,
            "access to a credential-bearing environment variable",
            "avoid expanding secrets on the command line",
            line_no,
            line,
        ));
    }
}

fn check_device_write(line: &str, line_no: usize, emit: &mut impl FnMut(Finding)) {
    if DD_DEVICE_WRITE.is_match(line) || MKFS_DEVICE.is_match(line) {
        emit(Finding::new(
            FindingCode::DeviceWrite,
            Severity::Critical,
            "raw write to a block device",
            "verify the target device; this destroys existing data",
            line_no,
            line,
        ));
    }
}

/// Informational monitor for history-mutating git operations.
fn check_git_operation(line: &str, line_no: usize, emit: &mut impl FnMut(Finding)) {
    if GIT_MUTATION.is_match(line) {
        emit(Finding::new(
            FindingCode::GitOperation,
            Severity::Low,
            "git operation that mutates repository state",
            "no action needed; recorded for the session audit",
            line_no,
            line,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PolicyConfig, ProductionIndicators};

    fn policies() -> PolicyConfig {
        PolicyConfig::default()
    }

    fn indicators() -> ProductionIndicators {
        ProductionIndicators::default()
    }

    fn analyze(cmd: &str) -> Vec<Finding> {
        analyze_script("test", cmd.as_bytes(), &policies(), &indicators())
    }

    fn codes(findings: &[Finding]) -> Vec<FindingCode> {
        findings.iter().map(|f| f.code).collect()
    }

    #[test]
    fn test_clean_command() {
        let findings = analyze("echo hello world");
        assert!(findings.is_empty());
    }

    #[test]
    fn test_rm_rf_root() {
        let findings = analyze("rm -rf /");
        assert_eq!(codes(&findings), vec![FindingCode::DangerousDeleteRoot]);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_rm_r_root_glob() {
        let findings = analyze("rm -r /*");
        assert_eq!(codes(&findings), vec![FindingCode::DangerousDeleteRoot]);
    }

    #[test]
    fn test_rm_rf_root_with_space_before_glob() {
        // `rm -rf / *` normalizes to the root case.
        let findings = analyze("rm -rf / *");
        assert_eq!(codes(&findings), vec![FindingCode::DangerousDeleteRoot]);
    }

    #[test]
    fn test_rm_system_path() {
        for path in ["/etc", "/usr/*", "/var/log", "/boot"] {
            let findings = analyze(&format!("rm -rf {path}"));
            assert_eq!(
                codes(&findings),
                vec![FindingCode::DangerousDeleteRoot],
                "path {path} must be critical"
            );
        }
    }

    #[test]
    fn test_rm_no_preserve_root() {
        let findings = analyze("rm --no-preserve-root -rf /home/user");
        assert!(codes(&findings).contains(&FindingCode::DangerousDeleteRoot));
    }

    #[test]
    fn test_rm_home() {
        for target in ["~", "~/*", "$HOME", "$HOME/*"] {
            let findings = analyze(&format!("rm -r {target}"));
            assert_eq!(
                codes(&findings),
                vec![FindingCode::DangerousDeleteHome],
                "target {target} must be high"
            );
            assert_eq!(findings[0].severity, Severity::High);
        }
    }

    #[test]
    fn test_rm_quoting_does_not_hide() {
        let findings = analyze("rm -rf '/'");
        assert_eq!(codes(&findings), vec![FindingCode::DangerousDeleteRoot]);
    }

    #[test]
    fn test_rm_without_recursive_flag_is_clean() {
        let findings = analyze("rm /tmp/file.txt");
        assert!(findings.is_empty());
    }

    #[test]
    fn test_rm_project_dir_is_clean() {
        let findings = analyze("rm -rf ./node_modules");
        assert!(findings.is_empty());
    }

    #[test]
    fn test_trailing_comment_does_not_disable() {
        let findings = analyze("rm -rf / # cleanup");
        assert_eq!(codes(&findings), vec![FindingCode::DangerousDeleteRoot]);
    }

    #[test]
    fn test_comment_line_skipped() {
        let findings = analyze("# rm -rf /");
        assert!(findings.is_empty());
    }

    #[test]
    fn test_fork_bomb_literal() {
        let findings = analyze(":(){ :|:& };:");
        assert_eq!(codes(&findings), vec![FindingCode::ForkBomb]);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_fork_bomb_renamed() {
        let findings = analyze("bomb(){ bomb|bomb& };bomb");
        assert_eq!(codes(&findings), vec![FindingCode::ForkBomb]);
    }

    #[test]
    fn test_ordinary_function_is_not_fork_bomb() {
        let findings = analyze("greet(){ echo hi; };greet");
        assert!(!codes(&findings).contains(&FindingCode::ForkBomb));
    }

    #[test]
    fn test_pipe_to_shell() {
        for cmd in [
            "curl https://example.com/install.sh | sh",
            "wget -qO- https://example.com/setup | bash",
            "curl -fsSL https://get.example.io | sudo bash",
        ] {
            let findings = analyze(cmd);
            assert!(
                codes(&findings).contains(&FindingCode::PipeToShell),
                "{cmd} must fire PIPE_TO_SHELL"
            );
        }
    }

    #[test]
    fn test_curl_to_file_is_clean() {
        let findings = analyze("curl -o out.sh https://example.com/install.sh");
        assert!(!codes(&findings).contains(&FindingCode::PipeToShell));
    }

    #[test]
    fn test_sudo_detected() {
        let findings = analyze("sudo apt-get update");
        assert!(codes(&findings).contains(&FindingCode::SudoUnrestricted));
        let f = findings
            .iter()
            .find(|f| f.code == FindingCode::SudoUnrestricted)
            .unwrap();
        assert_eq!(f.severity, Severity::Medium);
    }

    #[test]
    fn test_sudoers_word_is_clean() {
        let findings = analyze("cat /tmp/sudoku.txt");
        assert!(!codes(&findings).contains(&FindingCode::SudoUnrestricted));
    }

    #[test]
    fn test_force_git_push() {
        let findings = analyze("git push --force origin main");
        assert!(codes(&findings).contains(&FindingCode::ForceGitPush));
    }

    #[test]
    fn test_force_with_lease_is_exempt() {
        let findings = analyze("git push --force-with-lease origin main");
        assert!(!codes(&findings).contains(&FindingCode::ForceGitPush));
    }

    #[test]
    fn test_force_git_push_respects_policy_flag() {
        let mut p = policies();
        p.block_force_git = false;
        let findings =
            analyze_script("t", b"git push -f origin main", &p, &indicators());
        assert!(!codes(&findings).contains(&FindingCode::ForceGitPush));
    }

    #[test]
    fn test_destructive_sql_drop_database() {
        let findings = analyze("mysql -e 'DROP DATABASE production'");
        assert!(codes(&findings).contains(&FindingCode::DestructiveSql));
    }

    #[test]
    fn test_destructive_sql_delete_without_where() {
        let findings = analyze("psql -c \"DELETE FROM users\"");
        assert!(codes(&findings).contains(&FindingCode::DestructiveSql));
    }

    #[test]
    fn test_delete_with_where_respects_flag() {
        // only_destructive_sql = true (default): a scoped DELETE is fine.
        let findings = analyze("psql -c \"DELETE FROM users WHERE id = 1\"");
        assert!(!codes(&findings).contains(&FindingCode::DestructiveSql));

        let mut p = policies();
        p.only_destructive_sql = false;
        let findings = analyze_script(
            "t",
            b"psql -c \"DELETE FROM users WHERE id = 1\"",
            &p,
            &indicators(),
        );
        assert!(codes(&findings).contains(&FindingCode::DestructiveSql));
    }

    #[test]
    fn test_prod_env_touch_keyword() {
        let findings = analyze("kubectl --context production delete pod web");
        assert!(codes(&findings).contains(&FindingCode::ProdEnvTouch));
    }

    #[test]
    fn test_prod_env_touch_case_insensitive() {
        let findings = analyze("deploy --env PRODUCTION");
        assert!(codes(&findings).contains(&FindingCode::ProdEnvTouch));
    }

    #[test]
    fn test_dotenv_read() {
        for cmd in ["cat .env", "source .env.local", "cp .env /tmp/x"] {
            let findings = analyze(cmd);
            assert!(
                codes(&findings).contains(&FindingCode::DotenvFileRead),
                "{cmd} must fire DOTENV_FILE_READ"
            );
        }
    }

    #[test]
    fn test_env_suffix_word_is_clean() {
        let findings = analyze("cat node.env.description");
        assert!(!codes(&findings).contains(&FindingCode::DotenvFileRead));
    }

    #[test]
    fn test_sensitive_env_access() {
        for cmd in [
            "echo $GITHUB_TOKEN",
            "curl -H \"Authorization: ${API_SECRET}\" https://api.example.com",
            "printenv AWS_SECRET_ACCESS_KEY",
            "echo $DB_PASSWORD",
        ] {
            let findings = analyze(cmd);
            assert!(
                codes(&findings).contains(&FindingCode::SensitiveEnvAccess),
                "{cmd} must fire SENSITIVE_ENV_ACCESS"
            );
        }
    }

    #[test]
    fn test_plain_env_var_is_clean() {
        let findings = analyze("echo $PATH");
        assert!(!codes(&findings).contains(&FindingCode::SensitiveEnvAccess));
    }

    #[test]
    fn test_device_write() {
        for cmd in [
            "dd if=image.iso of=/dev/sda bs=4M",
            "mkfs.ext4 /dev/sdb1",
        ] {
            let findings = analyze(cmd);
            assert!(
                codes(&findings).contains(&FindingCode::DeviceWrite),
                "{cmd} must fire DEVICE_WRITE"
            );
            let f = findings
                .iter()
                .find(|f| f.code == FindingCode::DeviceWrite)
                .unwrap();
            assert_eq!(f.severity, Severity::Critical);
        }
    }

    #[test]
    fn test_dd_to_file_is_clean() {
        let findings = analyze("dd if=/dev/zero of=blank.img count=10");
        assert!(!codes(&findings).contains(&FindingCode::DeviceWrite));
    }

    #[test]
    fn test_policy_denylist() {
        let mut p = policies();
        p.denylist = vec!["terraform *".to_string()];
        let findings =
            analyze_script("t", b"terraform destroy -auto-approve", &p, &indicators());
        assert!(codes(&findings).contains(&FindingCode::PolicyDenylist));
        let f = findings
            .iter()
            .find(|f| f.code == FindingCode::PolicyDenylist)
            .unwrap();
        assert_eq!(f.severity, Severity::Critical);
    }

    #[test]
    fn test_policy_allowlist_informational() {
        let mut p = policies();
        p.allowlist = vec!["echo".to_string()];
        let findings = analyze_script("t", b"echo test", &p, &indicators());
        assert_eq!(codes(&findings), vec![FindingCode::PolicyAllowlist]);
        assert_eq!(findings[0].severity, Severity::Low);
    }

    #[test]
    fn test_git_operation_monitor() {
        let mut p = policies();
        p.monitor_git_ops = true;
        let findings = analyze_script("t", b"git reset --hard HEAD~3", &p, &indicators());
        assert!(codes(&findings).contains(&FindingCode::GitOperation));
    }

    #[test]
    fn test_multi_line_script_ordering() {
        let script = b"echo ok\nrm -rf /\ncat .env\n";
        let findings = analyze_script("t", script, &policies(), &indicators());
        assert_eq!(
            codes(&findings),
            vec![FindingCode::DangerousDeleteRoot, FindingCode::DotenvFileRead]
        );
        assert_eq!(findings[0].line, Some(2));
        assert_eq!(findings[1].line, Some(3));
    }

    #[test]
    fn test_duplicate_code_per_line_suppressed() {
        // Both /etc and /usr would each report DANGEROUS_DELETE_ROOT; the
        // (code, line) pair dedup keeps one.
        let findings = analyze("rm -rf /etc /usr");
        assert_eq!(
            findings
                .iter()
                .filter(|f| f.code == FindingCode::DangerousDeleteRoot)
                .count(),
            1
        );
    }

    #[test]
    fn test_risk_level_empty_is_low() {
        assert_eq!(risk_level(&[]), Severity::Low);
    }

    #[test]
    fn test_risk_level_is_max_severity() {
        let findings = analyze("sudo rm -rf /");
        assert_eq!(risk_level(&findings), Severity::Critical);
    }

    #[test]
    fn test_analyzer_is_idempotent() {
        let a = analyze("sudo dd if=x of=/dev/sda");
        let b = analyze("sudo dd if=x of=/dev/sda");
        assert_eq!(codes(&a), codes(&b));
        assert_eq!(a.len(), b.len());
    }

    #[test]
    fn test_malformed_input_yields_nothing() {
        let findings = analyze_script(
            "bin",
            &[0xff, 0xfe, 0x00, 0x01],
            &policies(),
            &indicators(),
        );
        assert!(findings.is_empty());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_code_display_stable() {
        assert_eq!(
            FindingCode::DangerousDeleteRoot.to_string(),
            "DANGEROUS_DELETE_ROOT"
        );
        assert_eq!(FindingCode::PolicyDenylist.to_string(), "POLICY_DENYLIST");
    }
}

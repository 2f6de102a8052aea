// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use regex::RegexSet;
use std::sync::OnceLock;

/// Shell patterns that warrant a confirmation round-trip before running.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    r"rm\s+(-rf?|--recursive)",
    r"rmdir",
    r"git\s+push\s+.*--force",
    r"git\s+push\s+-f",
    r"git\s+reset\s+--hard",
    r"DROP\s+TABLE",
    r"DELETE\s+FROM",
    r"mkfs\.",
    r"dd\s+if=",
    r">\s*/dev/",
    r"chmod\s+777",
    r"sudo\s+rm",
];

fn destructive_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(
            DESTRUCTIVE_PATTERNS
                .iter()
                .map(|p| format!("(?i){p}")),
        )
        .expect("destructive patterns are valid regexes")
    })
}

/// True when a shell command looks destructive.
pub fn is_destructive(command: &str) -> bool {
    destructive_set().is_match(command)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rm_rf_is_destructive() {
        assert!(is_destructive("rm -rf /tmp/build"));
        assert!(is_destructive("sudo rm /etc/hosts"));
    }

    #[test]
    fn force_push_is_destructive() {
        assert!(is_destructive("git push origin main --force"));
        assert!(is_destructive("git push -f"));
        assert!(is_destructive("git reset --hard HEAD~3"));
    }

    #[test]
    fn case_insensitive_sql() {
        assert!(is_destructive("drop table users"));
        assert!(is_destructive("delete from sessions where 1=1"));
    }

    #[test]
    fn ordinary_commands_are_fine() {
        assert!(!is_destructive("ls -la"));
        assert!(!is_destructive("cargo build --release"));
        assert!(!is_destructive("git push origin feature"));
        assert!(!is_destructive("rm"), "bare rm without flags is not matched");
    }
}

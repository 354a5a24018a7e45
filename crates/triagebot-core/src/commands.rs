//! Command parsing and dispatch: tokenizes raw chat text into a canonical
//! command name and argument list, then resolves the name against the
//! config-driven command table.

use std::collections::BTreeMap;

use chrono::Duration;
use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::session::blockquote;

const PUNCTUATION: &[char] = &['.', ',', '!', '?', '\'', '"', '`'];
const IGNORE_TIME_LIMIT: Duration = Duration::hours(4);

/// Replaces smart quotes and em/en dashes that autocorrect tends to
/// introduce, which would otherwise confuse the shell-like tokenizer.
pub fn normalize_input(text: &str) -> String {
    text.replace('\u{2018}', "'")
        .replace('\u{2019}', "'")
        .replace('\u{201c}', "\"")
        .replace('\u{201d}', "\"")
        .replace('\u{2013}', "--")
        .replace('\u{2014}', "--")
}

/// Lowercases and strips the punctuation set that people tend to use in
/// commands but that would never form part of a command name.
pub fn clean_command(token: &str) -> String {
    token.chars().filter(|c| !PUNCTUATION.contains(c)).collect::<String>().to_lowercase()
}

/// Shell-like tokenization honoring balanced quotes; falls back to a plain
/// whitespace split when the input has unbalanced quoting.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized = normalize_input(text);
    shell_words::split(&normalized).unwrap_or_else(|_| normalized.split_whitespace().map(str::to_string).collect())
}

/// Parses raw command text into `(canonical_name, args)`. Returns `None` for
/// empty input.
pub fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
    let tokens = tokenize(text);
    let (first, rest) = tokens.split_first()?;
    Some((clean_command(first), rest.to_vec()))
}

/// Resolves a config-file handler name to a concrete Rust function. Unknown
/// names are fatal at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handler {
    Hi,
    Help,
    AddToBlacklist,
    RemoveFromBlacklist,
    PositiveResponse,
    NegativeResponse,
    Ignore,
    Test,
}

impl Handler {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "hi" => Ok(Self::Hi),
            "help" => Ok(Self::Help),
            "add_to_blacklist" => Ok(Self::AddToBlacklist),
            "remove_from_blacklist" => Ok(Self::RemoveFromBlacklist),
            "positive_response" => Ok(Self::PositiveResponse),
            "negative_response" => Ok(Self::NegativeResponse),
            "ignore" => Ok(Self::Ignore),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::UnknownHandler(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub handler: Handler,
    pub info: String,
    #[serde(default)]
    pub usage: Vec<String>,
    #[serde(default)]
    pub success_msg: Option<String>,
    #[serde(default)]
    pub failure_msg: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// `name -> CommandSpec`, config-driven. Iteration order is
/// alphabetical (`BTreeMap`) to match `help`'s sorted listing.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct CommandTable(pub BTreeMap<String, CommandSpec>);

impl CommandTable {
    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.0.get(name)
    }
}

/// Outcome of a command invocation: `Some(true)`/`Some(false)` selects the
/// success/failure template, `None` means silent. Dispatch itself lives in
/// `coordinator::Coordinator::handle_command`, since built-ins like
/// `add_to_blacklist`/`test` need the coordinator's store handles, not just
/// the session.
pub type CommandOutcome = Option<bool>;

pub fn render_help(table: &CommandTable, messages: &BTreeMap<String, String>, show_hidden: bool) -> String {
    let header = messages.get("help_header").map(String::as_str).unwrap_or("Commands:");
    let usage_label = messages.get("help_usage").map(String::as_str).unwrap_or("usage");
    let footer = messages.get("help_footer").map(String::as_str).unwrap_or("");

    let mut out = format!("{header}\n\n");
    for (name, spec) in &table.0 {
        if spec.hidden && !show_hidden {
            continue;
        }
        out.push_str(&format!("`{name}`: {}\n", spec.info));
        if !spec.usage.is_empty() {
            let usage_lines = spec.usage.iter().map(|s| format!("\t{s}")).collect::<Vec<_>>().join("\n");
            out.push_str(&format!("{}\n{}\n", blockquote(usage_label), blockquote(&usage_lines)));
        }
    }
    out.push_str(footer);
    out
}

/// Parses the `ignore (last|current) <duration>` grammar: `which` selects
/// the target task, `duration` matches `([0-9]+h)?([0-9]+m)?`.
pub struct IgnoreArgs {
    pub target_last: bool,
    pub duration: Duration,
    /// Set when the requested duration exceeded `IGNORE_TIME_LIMIT` and was
    /// capped. The caller still proceeds with the capped duration, but must
    /// tell the user it happened.
    pub was_capped: bool,
}

pub fn parse_ignore_args(args: &[String]) -> Option<IgnoreArgs> {
    if args.len() != 2 {
        return None;
    }
    let target_last = match args[0].as_str() {
        "last" => true,
        "current" => false,
        _ => return None,
    };

    let re = Regex::new(r"(?i)^([0-9]+h)?([0-9]+m)?$").expect("static regex is valid");
    let caps = re.captures(&args[1])?;
    let hours: i64 = caps
        .get(1)
        .map(|m| m.as_str().trim_end_matches(['h', 'H']).parse().unwrap_or(0))
        .unwrap_or(0);
    let minutes: i64 = caps
        .get(2)
        .map(|m| m.as_str().trim_end_matches(['m', 'M']).parse().unwrap_or(0))
        .unwrap_or(0);

    if hours == 0 && minutes == 0 {
        return None;
    }

    let mut duration = Duration::hours(hours) + Duration::minutes(minutes);
    let was_capped = duration > IGNORE_TIME_LIMIT;
    if was_capped {
        duration = IGNORE_TIME_LIMIT;
    }
    Some(IgnoreArgs { target_last, duration, was_capped })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_smart_quotes_and_dashes() {
        let text = "\u{2018}hi\u{2019} \u{201c}ok\u{201d} \u{2013}\u{2014}";
        assert_eq!(normalize_input(text), "'hi' \"ok\" ----");
    }

    #[test]
    fn clean_command_strips_punctuation_and_lowercases() {
        assert_eq!(clean_command("Help!"), "help");
        assert_eq!(clean_command("\"Hi\""), "hi");
    }

    #[test]
    fn tokenizes_quoted_arguments() {
        let tokens = tokenize(r#"ignore current "1h30m""#);
        assert_eq!(tokens, vec!["ignore", "current", "1h30m"]);
    }

    #[test]
    fn falls_back_to_whitespace_split_on_unbalanced_quotes() {
        let tokens = tokenize(r#"ignore current "1h30m"#);
        assert_eq!(tokens, vec!["ignore", "current", "\"1h30m"]);
    }

    #[test]
    fn parse_command_extracts_canonical_name_and_args() {
        let (name, args) = parse_command("Yes! I did this").unwrap();
        assert_eq!(name, "yes");
        assert_eq!(args, vec!["I", "did", "this"]);
    }

    #[test]
    fn handler_parse_rejects_unknown_names() {
        assert!(matches!(Handler::parse("delete_everything"), Err(ConfigError::UnknownHandler(_))));
    }

    #[test]
    fn ignore_args_parses_combined_duration() {
        let parsed = parse_ignore_args(&["last".into(), "1h30m".into()]).unwrap();
        assert!(parsed.target_last);
        assert_eq!(parsed.duration, Duration::hours(1) + Duration::minutes(30));
        assert!(!parsed.was_capped);
    }

    #[test]
    fn ignore_args_caps_at_time_limit_and_flags_it() {
        let parsed = parse_ignore_args(&["current".into(), "10h".into()]).unwrap();
        assert_eq!(parsed.duration, IGNORE_TIME_LIMIT);
        assert!(parsed.was_capped);
    }

    #[test]
    fn ignore_args_rejects_zero_duration() {
        assert!(parse_ignore_args(&["current".into(), "0h0m".into()]).is_none());
    }

    #[test]
    fn ignore_args_rejects_bad_target() {
        assert!(parse_ignore_args(&["yesterday".into(), "1h".into()]).is_none());
    }
}

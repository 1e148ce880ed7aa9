//! POSIX shell quoting
//!
//! Arguments made only of characters the shell never interprets are
//! passed through; everything else is wrapped in single quotes, with
//! embedded single quotes spliced in as `'"'"'`.

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

static UNSAFE_CHAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_@%+=:,./-]").expect("static pattern is valid"));

/// Quote one argument so the shell yields it back byte-for-byte
pub fn quote(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("''");
    }
    if !UNSAFE_CHAR.is_match(arg) {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("'{}'", arg.replace('\'', r#"'"'"'"#)))
}

/// Quote every argument and join them with single spaces
pub fn join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| quote(a.as_ref()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

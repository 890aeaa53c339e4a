//! Shell quoting utilities.

/// Quote a string for use in a shell command.
/// Plain strings pass through; anything else is single-quoted with embedded
/// single quotes escaped.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if !needs_quoting(s) {
        return s.to_string();
    }

    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Check if a string needs quoting.
fn needs_quoting(s: &str) -> bool {
    s.chars().any(|c| {
        matches!(
            c,
            ' ' | '\t'
                | '\n'
                | '\r'
                | '"'
                | '\''
                | '\\'
                | '$'
                | '`'
                | '!'
                | '*'
                | '?'
                | '['
                | ']'
                | '{'
                | '}'
                | '('
                | ')'
                | '<'
                | '>'
                | '|'
                | '&'
                | ';'
                | '#'
                | '~'
        )
    })
}

/// Render an ordered environment as an `env` command prefix, trailing space
/// included. Empty input renders to nothing.
pub fn render_env_prefix(vars: &[(String, String)]) -> String {
    if vars.is_empty() {
        return String::new();
    }

    let mut prefix = String::from("env ");
    for (key, value) in vars {
        prefix.push_str(&quote(&format!("{key}={value}")));
        prefix.push(' ');
    }
    prefix
}

/// Join arguments with proper quoting for shell execution.
pub fn join_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|s| quote(s.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a shell command string into arguments.
pub fn split_args(s: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("simple"), "simple");
        assert_eq!(quote("with space"), "'with space'");
        assert_eq!(quote("it's"), "'it'\"'\"'s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("$var"), "'$var'");
    }

    #[test]
    fn test_join_args() {
        let args = vec!["echo", "hello world", "it's"];
        assert_eq!(join_args(args), "echo 'hello world' 'it'\"'\"'s'");
    }

    #[test]
    fn test_split_args() {
        let args = split_args("echo 'hello world' test").unwrap();
        assert_eq!(args, vec!["echo", "hello world", "test"]);
    }

    #[test]
    fn test_render_env_prefix() {
        assert_eq!(render_env_prefix(&[]), "");

        let vars = vec![
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "two words".to_string()),
        ];
        assert_eq!(render_env_prefix(&vars), "env A=1 'B=two words' ");
    }
}

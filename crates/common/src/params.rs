//! Params-string tokenization shared by status records, executors, and the
//! tool schema generator

/// Split a params string into whitespace-separated tokens, respecting
/// single and double quotes. Quotes stay in the token and are stripped by
/// [`parse_token`].
pub fn split_params(params: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in params.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                current.push(c);
            }
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                current.push(c);
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// One parsed parameter token: `name` alone is positional/required,
/// `name=default` is named with a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<String>,
}

pub fn parse_token(token: &str) -> ParamSpec {
    match token.split_once('=') {
        Some((name, default)) => ParamSpec {
            name: name.to_string(),
            default: Some(strip_quotes(default).to_string()),
        },
        None => ParamSpec {
            name: token.to_string(),
            default: None,
        },
    }
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'"' || bytes[0] == b'\'')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_quotes() {
        assert_eq!(
            split_params(r#"name="hello world" count=3 flag"#),
            vec![r#"name="hello world""#, "count=3", "flag"]
        );
        assert_eq!(split_params("a='x y'  b"), vec!["a='x y'", "b"]);
        assert!(split_params("   ").is_empty());
    }

    #[test]
    fn tokens_parse_into_specs() {
        assert_eq!(
            parse_token("count=3"),
            ParamSpec {
                name: "count".to_string(),
                default: Some("3".to_string()),
            }
        );
        assert_eq!(
            parse_token(r#"msg="hi there""#),
            ParamSpec {
                name: "msg".to_string(),
                default: Some("hi there".to_string()),
            }
        );
        assert_eq!(
            parse_token("bare"),
            ParamSpec {
                name: "bare".to_string(),
                default: None,
            }
        );
    }
}

//! Tokenizer
//!
//! A token is just a span of source text plus its origin (spec §4.9): no
//! typed token-kind enum, on the theory that the only consumer is the
//! parser's own `classify`, one call site, right before the text is thrown
//! away. Numbers, strings, symbols and words are all just text until then.
//!
//! String literals keep their surrounding quotes in `text` (escapes are
//! resolved later, by `classify`) rather than being unescaped here — it's
//! the tokenizer's job to find token *boundaries*, not to interpret what's
//! inside them.

/// A token with source position information (0-indexed, matching the
/// convention editor tooling expects).
#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    pub line: usize,
    pub col: usize,
}

impl Token {
    fn new(text: String, line: usize, col: usize) -> Self {
        Token { text, line, col }
    }
}

impl PartialEq<&str> for Token {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

/// Split `source` into tokens. Whitespace separates tokens; `"..."` string
/// literals are captured whole (escapes and all) even across internal
/// whitespace; `#` and `\` start a line comment that runs to the next
/// newline. Everything else — `( ) { } : ; -> {: :}` included — is just an
/// ordinary character as far as the tokenizer is concerned: it becomes its
/// own token only because whitespace happens to surround it in
/// conventionally-formatted source, exactly like any other word.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut start_line = 0usize;
    let mut start_col = 0usize;
    let mut line = 0usize;
    let mut col = 0usize;

    let mut chars = source.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '#' || ch == '\\' {
            while let Some(&c) = chars.peek() {
                if c == '\n' {
                    break;
                }
                chars.next();
                col += 1;
            }
            continue;
        }

        if ch == '"' {
            if !current.is_empty() {
                tokens.push(Token::new(std::mem::take(&mut current), start_line, start_col));
            }
            let (str_line, str_col) = (line, col);
            let mut text = String::from('"');
            col += 1;
            let mut escaped = false;
            for c in chars.by_ref() {
                text.push(c);
                if c == '\n' {
                    line += 1;
                    col = 0;
                } else {
                    col += 1;
                }
                if escaped {
                    escaped = false;
                    continue;
                }
                if c == '\\' {
                    escaped = true;
                    continue;
                }
                if c == '"' {
                    break;
                }
            }
            tokens.push(Token::new(text, str_line, str_col));
            continue;
        }

        if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(Token::new(std::mem::take(&mut current), start_line, start_col));
            }
            if ch == '\n' {
                line += 1;
                col = 0;
            } else {
                col += 1;
            }
            continue;
        }

        if current.is_empty() {
            start_line = line;
            start_col = col;
        }
        current.push(ch);
        col += 1;
    }

    if !current.is_empty() {
        tokens.push(Token::new(current, start_line, start_col));
    }
    tokens
}

/// A token classified by what it denotes. Borrows from the token text it
/// was built from except for `Str`, which needs a fresh buffer once
/// escapes are resolved.
pub enum Lexeme<'a> {
    Integer(i32),
    Float(f32),
    Str(String),
    Symbol(&'a str),
    Word(&'a str),
}

/// Classify `text` (one token's worth), resolving string escapes along the
/// way. The only failure modes are a malformed string literal (unterminated
/// or an unknown escape) or a numeric literal out of `i32` range.
pub fn classify(text: &str) -> Result<Lexeme<'_>, String> {
    if let Some(rest) = text.strip_prefix('"') {
        let inner = rest
            .strip_suffix('"')
            .ok_or_else(|| format!("unterminated string literal '{text}'"))?;
        return Ok(Lexeme::Str(unescape(inner)?));
    }
    if let Some(name) = text.strip_prefix('`') {
        if name.is_empty() {
            return Err("empty symbol literal '`'".to_string());
        }
        return Ok(Lexeme::Symbol(name));
    }
    if is_integer_literal(text) {
        let n: i64 = text
            .parse()
            .map_err(|_| format!("malformed integer literal '{text}'"))?;
        if !(i32::MIN as i64..=i32::MAX as i64).contains(&n) {
            return Err(format!("integer literal '{text}' out of range"));
        }
        return Ok(Lexeme::Integer(n as i32));
    }
    if is_float_literal(text) {
        let f: f32 = text
            .parse()
            .map_err(|_| format!("malformed float literal '{text}'"))?;
        return Ok(Lexeme::Float(f));
    }
    Ok(Lexeme::Word(text))
}

fn is_integer_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_float_literal(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    match digits.split_once('.') {
        Some((int_part, frac_part)) => {
            !int_part.is_empty()
                && !frac_part.is_empty()
                && int_part.bytes().all(|b| b.is_ascii_digit())
                && frac_part.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

fn unescape(s: &str) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(c) => {
                return Err(format!(
                    "unknown escape sequence '\\{c}' in string literal (supported: \\\" \\\\ \\n \\r \\t)"
                ))
            }
            None => return Err("string literal ends with a dangling '\\'".to_string()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn splits_on_whitespace() {
        let tokens = tokenize("2 3 + 4 *");
        assert_eq!(texts(&tokens), vec!["2", "3", "+", "4", "*"]);
    }

    #[test]
    fn list_braces_and_parens_are_ordinary_words() {
        let tokens = tokenize("( 1 2 3 )");
        assert_eq!(texts(&tokens), vec!["(", "1", "2", "3", ")"]);
    }

    #[test]
    fn locals_header_tokens_glue_without_whitespace() {
        let tokens = tokenize(": f {: a b :} a b + ;");
        assert_eq!(
            texts(&tokens),
            vec![":", "f", "{:", "a", "b", ":}", "a", "b", "+", ";"]
        );
    }

    #[test]
    fn string_literal_spans_whitespace() {
        let tokens = tokenize(r#""hello world" print"#);
        assert_eq!(texts(&tokens), vec![r#""hello world""#, "print"]);
    }

    #[test]
    fn comment_to_end_of_line_is_discarded() {
        let tokens = tokenize("1 2 + # this is a comment\n3 *");
        assert_eq!(texts(&tokens), vec!["1", "2", "+", "3", "*"]);
    }

    #[test]
    fn classify_recognizes_negative_integer() {
        match classify("-17").unwrap() {
            Lexeme::Integer(n) => assert_eq!(n, -17),
            _ => panic!("expected Integer"),
        }
    }

    #[test]
    fn classify_leaves_bare_minus_as_word() {
        match classify("-").unwrap() {
            Lexeme::Word(w) => assert_eq!(w, "-"),
            _ => panic!("expected Word"),
        }
    }

    #[test]
    fn classify_recognizes_float() {
        match classify("-3.5").unwrap() {
            Lexeme::Float(f) => assert_eq!(f, -3.5),
            _ => panic!("expected Float"),
        }
    }

    #[test]
    fn classify_resolves_escapes() {
        match classify(r#""a\nb""#).unwrap() {
            Lexeme::Str(s) => assert_eq!(s, "a\nb"),
            _ => panic!("expected Str"),
        }
    }

    #[test]
    fn classify_rejects_unterminated_string() {
        assert!(classify("\"abc").is_err());
    }

    #[test]
    fn classify_rejects_unknown_escape() {
        assert!(classify(r#""a\xb""#).is_err());
    }

    #[test]
    fn classify_recognizes_symbol() {
        match classify("`key").unwrap() {
            Lexeme::Symbol(s) => assert_eq!(s, "key"),
            _ => panic!("expected Symbol"),
        }
    }

    #[test]
    fn classify_word_like_2dup() {
        match classify("2dup").unwrap() {
            Lexeme::Word(w) => assert_eq!(w, "2dup"),
            _ => panic!("expected Word"),
        }
    }
}

//! Minimal Rego front end: recovers rule heads and the `data` references
//! their bodies make. No evaluation, no full grammar; just enough structure
//! for dependency analysis over the rule graph.

use std::collections::BTreeMap;
use std::fmt;

/// One segment of a reference path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefSegment {
    /// Literal string segment (`data.kubernetes` or `data["kubernetes"]`).
    String(String),
    /// Computed segment (`data.pods[x]`); matches nothing by name.
    Var,
}

/// Reference path rooted at the `data` document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Ref(pub Vec<RefSegment>);

impl Ref {
    /// Build a data-rooted ref from a slash-separated pointer, e.g.
    /// `"kubernetes"` or `"system/main"`.
    pub fn from_pointer(pointer: &str) -> Self {
        let mut segments = vec![RefSegment::String("data".to_string())];
        segments.extend(
            pointer
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| RefSegment::String(s.to_string())),
        );
        Ref(segments)
    }

    fn from_strings(segments: impl IntoIterator<Item = String>) -> Self {
        Ref(segments.into_iter().map(RefSegment::String).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&RefSegment> {
        self.0.get(i)
    }

    /// Segment-wise prefix match; a `Var` segment matches nothing.
    pub fn has_prefix(&self, prefix: &Ref) -> bool {
        if prefix.0.len() > self.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(prefix.0.iter())
            .all(|(a, b)| matches!((a, b), (RefSegment::String(x), RefSegment::String(y)) if x == y))
    }

    fn extended(&self, segment: RefSegment) -> Self {
        let mut cpy = self.clone();
        cpy.0.push(segment);
        cpy
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                RefSegment::String(s) if i == 0 => write!(f, "{}", s)?,
                RefSegment::String(s) => write!(f, ".{}", s)?,
                RefSegment::Var => write!(f, "[_]")?,
            }
        }
        Ok(())
    }
}

/// One parsed rule: absolute head path plus the data references found in
/// its definition.
#[derive(Debug, Clone)]
pub struct ParsedRule {
    pub head: Ref,
    pub refs: Vec<Ref>,
    pub line: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Punct(char),
}

struct Lexed {
    token: Token,
    line: usize,
}

/// Keywords that may appear at the top level between a rule head and its
/// body and must not be mistaken for a new rule.
const HEAD_KEYWORDS: &[&str] = &["if", "contains", "else"];

fn tokenize(source: &str) -> Result<Vec<Lexed>, ParseError> {
    let mut out = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;
    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            // Keep escaped characters verbatim; segment names
                            // never depend on escape semantics.
                            if let Some(esc) = chars.next() {
                                s.push(esc);
                            }
                        }
                        Some('\n') | None => {
                            return Err(ParseError {
                                line,
                                message: "unterminated string".to_string(),
                            })
                        }
                        Some(c) => s.push(c),
                    }
                }
                out.push(Lexed {
                    token: Token::Str(s),
                    line,
                });
            }
            '`' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('`') => break,
                        None => {
                            return Err(ParseError {
                                line,
                                message: "unterminated raw string".to_string(),
                            })
                        }
                        Some('\n') => {
                            line += 1;
                            s.push('\n');
                        }
                        Some(c) => s.push(c),
                    }
                }
                out.push(Lexed {
                    token: Token::Str(s),
                    line,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Lexed {
                    token: Token::Ident(s),
                    line,
                });
            }
            c if c.is_ascii_digit() => {
                // Numbers never contribute to reference paths.
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '.' {
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            c => {
                chars.next();
                out.push(Lexed {
                    token: Token::Punct(c),
                    line,
                });
            }
        }
    }
    Ok(out)
}

/// Span of one rule inside the token stream.
struct RuleSpan {
    /// Head path segments relative to the package.
    head: Vec<String>,
    line: usize,
    body: std::ops::Range<usize>,
}

/// Parse one module into rules with absolute head paths.
pub fn parse_module(source: &str) -> Result<Vec<ParsedRule>, ParseError> {
    let tokens = tokenize(source)?;
    let mut i = 0usize;
    let package = parse_package(&tokens, &mut i)?;

    let mut imports: BTreeMap<String, Ref> = BTreeMap::new();
    let mut spans: Vec<RuleSpan> = Vec::new();
    while i < tokens.len() {
        match &tokens[i].token {
            Token::Ident(kw) if kw == "import" => {
                i += 1;
                parse_import(&tokens, &mut i, &mut imports);
            }
            Token::Ident(_) => {
                let span = parse_rule_span(&tokens, &mut i);
                if let Some(span) = span {
                    spans.push(span);
                }
            }
            _ => i += 1,
        }
    }

    let rule_names: Vec<String> = spans
        .iter()
        .filter_map(|s| s.head.first().cloned())
        .collect();

    Ok(spans
        .into_iter()
        .map(|span| {
            let mut head_path = package.clone();
            head_path.extend(span.head);
            ParsedRule {
                head: Ref::from_strings(head_path),
                refs: collect_refs(&tokens[span.body], &package, &imports, &rule_names),
                line: span.line,
            }
        })
        .collect())
}

fn parse_package(tokens: &[Lexed], i: &mut usize) -> Result<Vec<String>, ParseError> {
    match tokens.get(*i).map(|t| &t.token) {
        Some(Token::Ident(kw)) if kw == "package" => {}
        _ => {
            return Err(ParseError {
                line: tokens.first().map(|t| t.line).unwrap_or(1),
                message: "expected package declaration".to_string(),
            })
        }
    }
    let line = tokens[*i].line;
    *i += 1;
    let mut path = vec!["data".to_string()];
    loop {
        match tokens.get(*i).map(|t| &t.token) {
            Some(Token::Ident(seg)) => {
                path.push(seg.clone());
                *i += 1;
            }
            _ => {
                return Err(ParseError {
                    line,
                    message: "expected package path segment".to_string(),
                })
            }
        }
        match tokens.get(*i).map(|t| &t.token) {
            Some(Token::Punct('.')) => *i += 1,
            _ => break,
        }
    }
    Ok(path)
}

/// Record an `import data.a.b [as alias]` alias; `input` and
/// `future.keywords` imports play no part in dependency analysis.
fn parse_import(tokens: &[Lexed], i: &mut usize, imports: &mut BTreeMap<String, Ref>) {
    let mut path: Vec<String> = Vec::new();
    while let Some(Token::Ident(seg)) = tokens.get(*i).map(|t| &t.token) {
        if seg == "as" {
            break;
        }
        path.push(seg.clone());
        *i += 1;
        if !matches!(tokens.get(*i).map(|t| &t.token), Some(Token::Punct('.'))) {
            break;
        }
        *i += 1;
    }
    let alias = match tokens.get(*i).map(|t| &t.token) {
        Some(Token::Ident(kw)) if kw == "as" => match tokens.get(*i + 1).map(|t| &t.token) {
            Some(Token::Ident(a)) => {
                *i += 2;
                Some(a.clone())
            }
            _ => None,
        },
        _ => path.last().cloned(),
    };
    if path.first().map(String::as_str) == Some("data") {
        if let Some(alias) = alias {
            imports.insert(alias, Ref::from_strings(path));
        }
    }
}

/// Parse a rule head at `i` and locate the end of its definition. Returns
/// `None` for stray keywords that cannot start a rule.
fn parse_rule_span(tokens: &[Lexed], i: &mut usize) -> Option<RuleSpan> {
    let name = match &tokens[*i].token {
        Token::Ident(name) => name.clone(),
        _ => return None,
    };
    if HEAD_KEYWORDS.contains(&name.as_str()) {
        *i += 1;
        return None;
    }
    let line = tokens[*i].line;
    let mut head = Vec::new();
    let mut j = *i;
    if name == "default" {
        j += 1;
        match tokens.get(j).map(|t| &t.token) {
            Some(Token::Ident(n)) => head.push(n.clone()),
            _ => {
                *i = j;
                return None;
            }
        }
    } else {
        head.push(name);
    }
    j += 1;
    // Dotted head path (`a.b.c := ...`).
    while matches!(tokens.get(j).map(|t| &t.token), Some(Token::Punct('.'))) {
        match tokens.get(j + 1).map(|t| &t.token) {
            Some(Token::Ident(seg)) => {
                head.push(seg.clone());
                j += 2;
            }
            _ => break,
        }
    }
    let body = j..rule_end(tokens, j);
    *i = body.end;
    Some(RuleSpan { head, line, body })
}

/// Index just past the current rule: the next top-level identifier that can
/// start a new rule.
fn rule_end(tokens: &[Lexed], start: usize) -> usize {
    let mut depth = 0i32;
    let mut i = start;
    while i < tokens.len() {
        match &tokens[i].token {
            Token::Punct(c) => {
                match c {
                    '{' | '[' | '(' => depth += 1,
                    '}' | ']' | ')' => depth -= 1,
                    _ => {}
                }
                i += 1;
            }
            Token::Ident(kw) if depth == 0 && kw == "contains" => {
                // `deny contains msg if { ... }`: the term after the keyword
                // belongs to this rule's head.
                i += 1;
                if matches!(tokens.get(i).map(|t| &t.token), Some(Token::Ident(_))) {
                    i += 1;
                }
            }
            Token::Ident(kw) if depth == 0 && HEAD_KEYWORDS.contains(&kw.as_str()) => i += 1,
            Token::Ident(kw) if depth == 0 && kw == "import" => break,
            Token::Ident(_) if depth == 0 => {
                // An identifier right after an operator continues this
                // rule's value (`x := data.a`); anything else starts the
                // next rule.
                let continues = i > start
                    && matches!(
                        tokens.get(i - 1).map(|t| &t.token),
                        Some(Token::Punct('=' | ':' | '.' | ',' | '|' | '&' | '+' | '-' | '*' | '/' | '['))
                    );
                if continues {
                    i += 1;
                } else {
                    break;
                }
            }
            _ => i += 1,
        }
    }
    i
}

/// Collect absolute data references inside one rule's token span.
fn collect_refs(
    tokens: &[Lexed],
    package: &[String],
    imports: &BTreeMap<String, Ref>,
    rule_names: &[String],
) -> Vec<Ref> {
    let mut refs = Vec::new();
    let mut i = 0usize;
    while i < tokens.len() {
        match &tokens[i].token {
            Token::Ident(name) => {
                // A selector in `foo.bar` never opens a fresh reference.
                let after_dot = i > 0 && matches!(tokens[i - 1].token, Token::Punct('.'));
                if after_dot {
                    i += 1;
                    continue;
                }
                let base = if name == "data" {
                    Some(Ref::from_strings(["data".to_string()]))
                } else if let Some(imported) = imports.get(name) {
                    Some(imported.clone())
                } else if rule_names.iter().any(|n| n == name) {
                    let mut path = package.to_vec();
                    path.push(name.clone());
                    Some(Ref::from_strings(path))
                } else {
                    None
                };
                match base {
                    Some(base) => {
                        let (r, next) = chase_selectors(tokens, i + 1, base);
                        refs.push(r);
                        i = next;
                    }
                    None => i += 1,
                }
            }
            _ => i += 1,
        }
    }
    refs
}

/// Extend `base` with `.ident`, `["lit"]` and `[expr]` selectors.
fn chase_selectors(tokens: &[Lexed], mut i: usize, mut base: Ref) -> (Ref, usize) {
    loop {
        match tokens.get(i).map(|t| &t.token) {
            Some(Token::Punct('.')) => match tokens.get(i + 1).map(|t| &t.token) {
                Some(Token::Ident(seg)) => {
                    base = base.extended(RefSegment::String(seg.clone()));
                    i += 2;
                }
                _ => break,
            },
            Some(Token::Punct('[')) => {
                // Literal string selector keeps the name; anything else is a
                // computed segment.
                if let (Some(Token::Str(s)), Some(Token::Punct(']'))) = (
                    tokens.get(i + 1).map(|t| &t.token),
                    tokens.get(i + 2).map(|t| &t.token),
                ) {
                    base = base.extended(RefSegment::String(s.clone()));
                    i += 3;
                } else {
                    base = base.extended(RefSegment::Var);
                    let mut depth = 1i32;
                    i += 1;
                    while i < tokens.len() && depth > 0 {
                        match &tokens[i].token {
                            Token::Punct('[') => depth += 1,
                            Token::Punct(']') => depth -= 1,
                            _ => {}
                        }
                        i += 1;
                    }
                }
            }
            _ => break,
        }
    }
    (base, i)
}

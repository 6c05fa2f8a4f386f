// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Query-string language of the embedded index.
//!
//! ```text
//! +host:web-1 -level:>4 "disk full" short_message:boot
//! ```
//!
//! Clauses are separated by whitespace. `+` marks a clause that must match,
//! `-` one that must not; unmarked clauses are optional, and at least one of
//! them has to match when no `+` clause is present.

use std::iter::Peekable;
use std::str::CharIndices;

use unicode_segmentation::UnicodeSegmentation;

pub const ALL_FIELD: &str = "_all";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Matched on the exact value.
    Keyword,
    /// Lower-cased word tokens.
    Text,
    Numeric,
    Date,
}

pub fn field_kind(field: &str) -> FieldKind {
    match field {
        "id" | "version" | "host" | "facility" | "file" => FieldKind::Keyword,
        "level" | "line" => FieldKind::Numeric,
        "timestamp" => FieldKind::Date,
        _ => FieldKind::Text,
    }
}

/// Splits text into lower-cased unicode words.
pub fn analyze(text: &str) -> Vec<String> {
    text.unicode_words().map(str::to_lowercase).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    Must,
    MustNot,
    Should,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn holds(self, value: f64, operand: f64) -> bool {
        match self {
            CompareOp::Gt => value > operand,
            CompareOp::Gte => value >= operand,
            CompareOp::Lt => value < operand,
            CompareOp::Lte => value <= operand,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Matcher {
    Term(String),
    Phrase(String),
    Compare(CompareOp, f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub occur: Occur,
    /// `_all` when the clause has no qualifier.
    pub field: String,
    pub matcher: Matcher,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedQuery {
    pub clauses: Vec<Clause>,
}

impl ParsedQuery {
    pub fn is_match_all(&self) -> bool {
        self.clauses.is_empty()
    }
}

pub fn parse(input: &str) -> Result<ParsedQuery, String> {
    let mut parser = Parser {
        input,
        chars: input.char_indices().peekable(),
    };
    let mut clauses = Vec::new();
    while let Some(clause) = parser.next_clause()? {
        clauses.push(clause);
    }
    Ok(ParsedQuery { clauses })
}

struct Parser<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn at_clause_end(&mut self) -> bool {
        self.chars.peek().map_or(true, |(_, c)| c.is_whitespace())
    }

    fn position(&mut self) -> usize {
        self.chars.peek().map_or(self.input.len(), |(i, _)| *i)
    }

    /// Consumes up to the next whitespace and returns the slice.
    fn word(&mut self) -> &'a str {
        let start = self.position();
        while self.chars.next_if(|(_, c)| !c.is_whitespace()).is_some() {}
        let end = self.position();
        &self.input[start..end]
    }

    fn next_clause(&mut self) -> Result<Option<Clause>, String> {
        self.skip_whitespace();
        let Some(&(_, first)) = self.chars.peek() else {
            return Ok(None);
        };

        let occur = match first {
            '+' => Occur::Must,
            '-' => Occur::MustNot,
            _ => Occur::Should,
        };
        if occur != Occur::Should {
            self.chars.next();
            if self.at_clause_end() {
                return Err(format!("empty clause after '{first}'"));
            }
        }

        let field = self.qualifier()?;
        let matcher = self.matcher(field.as_deref())?;
        Ok(Some(Clause {
            occur,
            field: field.unwrap_or_else(|| ALL_FIELD.to_string()),
            matcher,
        }))
    }

    /// Reads `field:` when the current clause starts with one.
    fn qualifier(&mut self) -> Result<Option<String>, String> {
        let rest = &self.input[self.position()..];
        if rest.starts_with('"') {
            return Ok(None);
        }
        let head = rest.split(char::is_whitespace).next().unwrap_or_default();
        let Some(colon) = head.find(':') else {
            return Ok(None);
        };
        if head[..colon].contains('"') {
            return Ok(None);
        }
        if colon == 0 {
            return Err("empty field name".to_string());
        }

        let field = head[..colon].to_string();
        for _ in 0..=field.chars().count() {
            self.chars.next();
        }
        if self.at_clause_end() {
            return Err(format!("empty clause after '{field}:'"));
        }
        Ok(Some(field))
    }

    fn matcher(&mut self, field: Option<&str>) -> Result<Matcher, String> {
        let Some(&(_, first)) = self.chars.peek() else {
            return Err("empty clause".to_string());
        };

        match first {
            '"' => {
                self.chars.next();
                let start = self.position();
                while self.chars.next_if(|(_, c)| *c != '"').is_some() {}
                let end = self.position();
                if self.chars.next().is_none() {
                    return Err("unterminated quote".to_string());
                }
                let phrase = self.input[start..end].trim();
                if phrase.is_empty() {
                    return Err("empty phrase".to_string());
                }
                Ok(Matcher::Phrase(phrase.to_string()))
            }
            '>' | '<' => {
                let word = self.word();
                let (op, operand) = if let Some(v) = word.strip_prefix(">=") {
                    (CompareOp::Gte, v)
                } else if let Some(v) = word.strip_prefix("<=") {
                    (CompareOp::Lte, v)
                } else if let Some(v) = word.strip_prefix('>') {
                    (CompareOp::Gt, v)
                } else {
                    (CompareOp::Lt, &word[1..])
                };

                let name = field.unwrap_or(ALL_FIELD);
                if field_kind(name) != FieldKind::Numeric {
                    return Err(format!("comparison on non-numeric field '{name}'"));
                }
                let operand = operand
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| format!("non-numeric operand '{operand}'"))?;
                Ok(Matcher::Compare(op, operand))
            }
            _ => Ok(Matcher::Term(self.word().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clause(occur: Occur, field: &str, matcher: Matcher) -> Clause {
        Clause {
            occur,
            field: field.to_string(),
            matcher,
        }
    }

    #[test]
    fn test_empty_query_is_match_all() {
        assert!(parse("").unwrap().is_match_all());
        assert!(parse("   \t ").unwrap().is_match_all());
    }

    #[test]
    fn test_parse_mixed_clauses() {
        let query = parse(r#"+host:web-1 -level:>4 "disk full" boot"#).unwrap();
        assert_eq!(
            query.clauses,
            vec![
                clause(Occur::Must, "host", Matcher::Term("web-1".into())),
                clause(
                    Occur::MustNot,
                    "level",
                    Matcher::Compare(CompareOp::Gt, 4.0)
                ),
                clause(
                    Occur::Should,
                    ALL_FIELD,
                    Matcher::Phrase("disk full".into())
                ),
                clause(Occur::Should, ALL_FIELD, Matcher::Term("boot".into())),
            ]
        );
    }

    #[test]
    fn test_parse_qualified_phrase_and_comparisons() {
        let query = parse(r#"short_message:"boot ok" line:<=10 level:>=3 level:<1"#).unwrap();
        assert_eq!(query.clauses[0].matcher, Matcher::Phrase("boot ok".into()));
        assert_eq!(query.clauses[0].field, "short_message");
        assert_eq!(
            query.clauses[1].matcher,
            Matcher::Compare(CompareOp::Lte, 10.0)
        );
        assert_eq!(
            query.clauses[2].matcher,
            Matcher::Compare(CompareOp::Gte, 3.0)
        );
        assert_eq!(
            query.clauses[3].matcher,
            Matcher::Compare(CompareOp::Lt, 1.0)
        );
    }

    #[test]
    fn test_colon_inside_quotes_is_not_a_qualifier() {
        let query = parse(r#""a:b c""#).unwrap();
        assert_eq!(query.clauses[0].field, ALL_FIELD);
        assert_eq!(query.clauses[0].matcher, Matcher::Phrase("a:b c".into()));
    }

    #[test]
    fn test_syntax_errors() {
        for (input, expected) in [
            (r#"host:"web"#, "unterminated quote"),
            (r#""oops"#, "unterminated quote"),
            ("+", "empty clause after '+'"),
            ("boot - ok", "empty clause after '-'"),
            ("host:", "empty clause after 'host:'"),
            (":web", "empty field name"),
            ("level:>high", "non-numeric operand"),
            ("host:>3", "comparison on non-numeric field"),
            (">3", "comparison on non-numeric field"),
        ] {
            let err = parse(input).unwrap_err();
            assert!(
                err.contains(expected),
                "{input:?} gave {err:?}, expected {expected:?}"
            );
        }
    }

    #[test]
    fn test_analyze_lowercases_words() {
        assert_eq!(
            analyze("Boot OK, disk-full!"),
            vec!["boot", "ok", "disk", "full"]
        );
        assert_eq!(analyze("h1"), vec!["h1"]);
    }

    #[test]
    fn test_field_kinds() {
        assert_eq!(field_kind("host"), FieldKind::Keyword);
        assert_eq!(field_kind("level"), FieldKind::Numeric);
        assert_eq!(field_kind("timestamp"), FieldKind::Date);
        assert_eq!(field_kind("extra._user"), FieldKind::Text);
        assert_eq!(field_kind(ALL_FIELD), FieldKind::Text);
    }
}

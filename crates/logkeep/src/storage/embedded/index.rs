// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory inverted index over stored records.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::record::LogRecord;
use crate::storage::embedded::query::{
    analyze, field_kind, Clause, FieldKind, Matcher, Occur, ParsedQuery, ALL_FIELD,
};

type Postings = HashMap<String, HashSet<String>>;

#[derive(Default)]
pub struct MemoryIndex {
    docs: HashMap<String, LogRecord>,
    /// field -> token (or exact keyword value) -> ids
    terms: HashMap<String, Postings>,
    /// field -> value -> ids
    numbers: HashMap<&'static str, BTreeMap<i64, HashSet<String>>>,
    by_time: BTreeSet<(DateTime<Utc>, String)>,
}

/// One page of matches, newest first.
pub struct Hits<'a> {
    pub total: u64,
    pub records: Vec<&'a LogRecord>,
}

fn extra_value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Every (field, term) pair under which `record` is indexed.
fn index_terms(record: &LogRecord) -> Vec<(String, String)> {
    let mut terms = Vec::new();
    let mut push_keyword = |field: &str, value: &str| {
        if !value.is_empty() {
            terms.push((field.to_string(), value.to_string()));
            for token in analyze(value) {
                terms.push((ALL_FIELD.to_string(), token));
            }
        }
    };
    push_keyword("version", &record.version);
    push_keyword("host", &record.host);
    push_keyword("facility", &record.facility);
    push_keyword("file", &record.file);

    let mut texts = vec![
        ("short_message".to_string(), record.short_message.clone()),
        ("full_message".to_string(), record.full_message.clone()),
    ];
    for (key, value) in &record.extra {
        if let Some(text) = extra_value_text(value) {
            texts.push((format!("extra.{key}"), text));
        }
    }
    for (field, text) in texts {
        for token in analyze(&text) {
            terms.push((field.clone(), token.clone()));
            terms.push((ALL_FIELD.to_string(), token));
        }
    }

    terms.push(("timestamp".to_string(), record.timestamp.to_rfc3339()));
    terms
}

fn text_of(record: &LogRecord, field: &str) -> Vec<String> {
    match field {
        "short_message" => vec![record.short_message.clone()],
        "full_message" => vec![record.full_message.clone()],
        ALL_FIELD => {
            let mut texts = vec![
                record.short_message.clone(),
                record.full_message.clone(),
                record.host.clone(),
                record.version.clone(),
                record.facility.clone(),
                record.file.clone(),
            ];
            texts.extend(record.extra.values().filter_map(extra_value_text));
            texts
        }
        _ => field
            .strip_prefix("extra.")
            .and_then(|key| record.extra.get(key))
            .and_then(extra_value_text)
            .into_iter()
            .collect(),
    }
}

fn number_of(record: &LogRecord, field: &str) -> Option<i64> {
    match field {
        "level" => Some(i64::from(record.level)),
        "line" => Some(i64::from(record.line)),
        _ => None,
    }
}

fn contains_sequence(haystack: &[String], needle: &[String]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

impl MemoryIndex {
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&LogRecord> {
        self.docs.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &LogRecord> {
        self.docs.values()
    }

    /// Adds or replaces a record. Returns true when an older version existed.
    pub fn insert(&mut self, record: LogRecord) -> bool {
        let replaced = self.remove(&record.id);
        let id = record.id.clone();

        for (field, term) in index_terms(&record) {
            self.terms
                .entry(field)
                .or_default()
                .entry(term)
                .or_default()
                .insert(id.clone());
        }
        for field in ["level", "line"] {
            if let Some(value) = number_of(&record, field) {
                self.numbers
                    .entry(field)
                    .or_default()
                    .entry(value)
                    .or_default()
                    .insert(id.clone());
            }
        }
        self.by_time.insert((record.timestamp, id.clone()));
        self.docs.insert(id, record);
        replaced
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let Some(record) = self.docs.remove(id) else {
            return false;
        };

        for (field, term) in index_terms(&record) {
            if let Some(postings) = self.terms.get_mut(&field) {
                if let Some(ids) = postings.get_mut(&term) {
                    ids.remove(id);
                    if ids.is_empty() {
                        postings.remove(&term);
                    }
                }
            }
        }
        for field in ["level", "line"] {
            if let (Some(value), Some(values)) =
                (number_of(&record, field), self.numbers.get_mut(field))
            {
                if let Some(ids) = values.get_mut(&value) {
                    ids.remove(id);
                    if ids.is_empty() {
                        values.remove(&value);
                    }
                }
            }
        }
        self.by_time.remove(&(record.timestamp, record.id));
        true
    }

    /// Ids of the oldest records with a timestamp strictly before `cutoff`.
    pub fn expired(&self, cutoff: DateTime<Utc>, limit: usize) -> Vec<String> {
        self.by_time
            .iter()
            .take_while(|(ts, _)| *ts < cutoff)
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn postings(&self, field: &str, term: &str) -> HashSet<String> {
        self.terms
            .get(field)
            .and_then(|postings| postings.get(term))
            .cloned()
            .unwrap_or_default()
    }

    fn all_ids(&self) -> HashSet<String> {
        self.docs.keys().cloned().collect()
    }

    fn intersect_tokens(&self, field: &str, tokens: &[String]) -> HashSet<String> {
        let mut result: Option<HashSet<String>> = None;
        for token in tokens {
            let ids = self.postings(field, token);
            result = Some(match result {
                None => ids,
                Some(acc) => acc.intersection(&ids).cloned().collect(),
            });
        }
        result.unwrap_or_default()
    }

    fn clause_matches(&self, clause: &Clause) -> HashSet<String> {
        let field = clause.field.as_str();
        match (&clause.matcher, field_kind(field)) {
            (Matcher::Compare(op, operand), _) => self
                .numbers
                .get(field)
                .map(|values| {
                    values
                        .iter()
                        .filter(|(value, _)| op.holds(**value as f64, *operand))
                        .flat_map(|(_, ids)| ids.iter().cloned())
                        .collect()
                })
                .unwrap_or_default(),
            (Matcher::Term(term) | Matcher::Phrase(term), FieldKind::Numeric) => {
                match (term.parse::<f64>().ok(), self.numbers.get(field)) {
                    (Some(wanted), Some(values)) => values
                        .iter()
                        .filter(|(value, _)| (**value as f64 - wanted).abs() < f64::EPSILON)
                        .flat_map(|(_, ids)| ids.iter().cloned())
                        .collect(),
                    _ => HashSet::new(),
                }
            }
            (Matcher::Term(term) | Matcher::Phrase(term), FieldKind::Keyword) => {
                if field == "id" {
                    return self
                        .docs
                        .get(term)
                        .map(|r| r.id.clone())
                        .into_iter()
                        .collect();
                }
                self.postings(field, term)
            }
            (Matcher::Term(term) | Matcher::Phrase(term), FieldKind::Date) => {
                match term.parse::<DateTime<Utc>>() {
                    Ok(ts) => self.postings(field, &ts.to_rfc3339()),
                    Err(_) => HashSet::new(),
                }
            }
            (Matcher::Term(term), FieldKind::Text) => self.intersect_tokens(field, &analyze(term)),
            (Matcher::Phrase(phrase), FieldKind::Text) => {
                let tokens = analyze(phrase);
                self.intersect_tokens(field, &tokens)
                    .into_iter()
                    .filter(|id| {
                        self.docs.get(id).is_some_and(|record| {
                            text_of(record, field)
                                .iter()
                                .any(|text| contains_sequence(&analyze(text), &tokens))
                        })
                    })
                    .collect()
            }
        }
    }

    /// Ids matching `query`, or `None` for match-all.
    fn matching_ids(&self, query: &ParsedQuery) -> Option<HashSet<String>> {
        if query.is_match_all() {
            return None;
        }

        let mut must: Option<HashSet<String>> = None;
        let mut should: HashSet<String> = HashSet::new();
        let mut has_should = false;
        let mut must_not: HashSet<String> = HashSet::new();

        for clause in &query.clauses {
            let ids = self.clause_matches(clause);
            match clause.occur {
                Occur::Must => {
                    must = Some(match must {
                        None => ids,
                        Some(acc) => acc.intersection(&ids).cloned().collect(),
                    });
                }
                Occur::Should => {
                    has_should = true;
                    should.extend(ids);
                }
                Occur::MustNot => must_not.extend(ids),
            }
        }

        let mut result = match must {
            Some(ids) => ids,
            None if has_should => should,
            None => self.all_ids(),
        };
        result.retain(|id| !must_not.contains(id));
        Some(result)
    }

    /// Matches newest first, restricted to `[from, to]` where given.
    pub fn search(
        &self,
        query: &ParsedQuery,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        offset: usize,
        limit: usize,
    ) -> Hits<'_> {
        let ids = self.matching_ids(query);

        let lower = match from {
            Some(from) => Bound::Included((from, String::new())),
            None => Bound::Unbounded,
        };
        // ids never exceed this sentinel
        let upper = match to {
            Some(to) => Bound::Included((to, String::from(char::MAX))),
            None => Bound::Unbounded,
        };

        let mut total = 0u64;
        let mut records = Vec::new();
        let candidates = self
            .by_time
            .range((lower, upper))
            .rev()
            .filter(|(_, id)| ids.as_ref().map_or(true, |ids| ids.contains(id)));
        for (_, id) in candidates {
            if total as usize >= offset && records.len() < limit {
                if let Some(record) = self.docs.get(id) {
                    records.push(record);
                }
            }
            total += 1;
        }

        Hits { total, records }
    }
}

//! Decoder for encoded tuple strings.
//!
//! Backends return multi-field answers as text. The structured-query backend renders a list
//! of tuples as
//!
//! ```text
//! [Tuple {
//!     "answerValue": "2020-01-01^http://www.nlm.nih.gov/research/umls/rxnorm^1049630^diphenhydramine^25^mg"
//!     "fhirField": "dosage"
//!     "sourceNote": "Reported at intake"
//! }, Tuple { ... }]
//! ```
//!
//! with fields separated by tabs or newlines, keys optionally quoted, and each field split on
//! its first `:`. The text-analytics backend sends a single record as a comma separated
//! key/value body (`"answerValue": "x", "sourceNote": "y"`).
//!
//! Both forms go through the same small recursive-descent parser. Quote characters are never
//! part of a decoded value, and values may contain `: ` and `,`. A quote only closes a value
//! when a field terminator follows it; quotes anywhere else are dropped and backslashes are
//! kept as written.

use std::collections::BTreeMap;

/// Errors raised while decoding a tuple string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TupleError {
    #[error("expected {expected} at offset {offset}")]
    Expected { expected: &'static str, offset: usize },
    #[error("unterminated quoted value starting at offset {0}")]
    UnterminatedString(usize),
    #[error("unexpected trailing input at offset {0}")]
    TrailingInput(usize),
}

/// One decoded tuple: field name to field value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedTupleRecord {
    fields: BTreeMap<String, String>,
}

impl DecodedTupleRecord {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn answer_value(&self) -> Option<&str> {
        self.get("answerValue")
    }

    pub fn source_note(&self) -> Option<&str> {
        self.get("sourceNote")
    }

    /// Resource-kind hint, either a bare field (`dosage`) or a dotted path (`Procedure.code`).
    pub fn fhir_field(&self) -> Option<&str> {
        self.get("fhirField")
    }

    pub fn value_type(&self) -> Option<&str> {
        self.get("valueType")
    }

    pub fn fhir_resource_id(&self) -> Option<&str> {
        self.get("fhirResourceId")
    }

    /// Text-analytics answer category (`generic`, `providerassertion`, ...).
    pub fn answer_type(&self) -> Option<&str> {
        self.get("answerType")
    }

    /// The `^`-delimited positional payload of `answerValue`.
    ///
    /// Positions are: effective date, coding system, code, display, then optionally a value
    /// and a unit.
    pub fn answer_segments(&self) -> Vec<&str> {
        self.answer_value()
            .map(|v| v.split('^').collect())
            .unwrap_or_default()
    }

    /// True when the answer's leading segment is the `null` sentinel.
    pub fn is_null_answer(&self) -> bool {
        self.answer_value()
            .and_then(|v| v.split('^').next())
            .is_some_and(|first| first == "null")
    }
}

impl FromIterator<(String, String)> for DecodedTupleRecord {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Returns true if a scalar result holds an encoded tuple list.
pub fn looks_like_tuple_list(value: &str) -> bool {
    value.trim_start().starts_with("[Tuple")
}

/// Decodes a tuple list (`[Tuple {...}, Tuple {...}]`). The outer brackets are optional.
///
/// # Errors
///
/// Returns a [`TupleError`] carrying the offset of the first malformed element.
pub fn decode(input: &str) -> Result<Vec<DecodedTupleRecord>, TupleError> {
    let mut parser = Parser::new(input);
    parser.skip_whitespace();
    let bracketed = parser.eat('[');

    let mut records = Vec::new();
    loop {
        parser.skip_separators();
        if bracketed && parser.eat(']') {
            break;
        }
        if parser.at_end() {
            if bracketed {
                return Err(parser.expected("']'"));
            }
            break;
        }
        records.push(parser.tuple()?);
    }

    parser.skip_whitespace();
    if !parser.at_end() {
        return Err(TupleError::TrailingInput(parser.pos));
    }
    Ok(records)
}

/// Decodes a single comma separated key/value body, optionally wrapped in braces.
pub fn decode_key_values(input: &str) -> Result<DecodedTupleRecord, TupleError> {
    let mut parser = Parser::new(input);
    parser.skip_whitespace();
    let record = if parser.eat('{') {
        let record = parser.fields(Mode::KeyValues, Some('}'))?;
        parser.expect('}', "'}'")?;
        record
    } else {
        parser.fields(Mode::KeyValues, None)?
    };

    parser.skip_whitespace();
    if !parser.at_end() {
        return Err(TupleError::TrailingInput(parser.pos));
    }
    Ok(record)
}

// ============================================================================
// Parser (internal)
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Fields end at a tab or newline.
    Tuple,
    /// Fields end at a comma.
    KeyValues,
}

impl Mode {
    fn ends_value(self, c: char) -> bool {
        match self {
            Mode::Tuple => matches!(c, '\t' | '\n' | '\r' | '}'),
            Mode::KeyValues => matches!(c, ',' | '\n' | '}'),
        }
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char, expected: &'static str) -> Result<(), TupleError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.expected(expected))
        }
    }

    fn expected(&self, expected: &'static str) -> TupleError {
        TupleError::Expected {
            expected,
            offset: self.pos,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace() || c == ',') {
            self.pos += 1;
        }
    }

    fn skip_inline_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.pos += 1;
        }
    }

    fn tuple(&mut self) -> Result<DecodedTupleRecord, TupleError> {
        for expected in "Tuple".chars() {
            if !self.eat(expected) {
                return Err(self.expected("'Tuple'"));
            }
        }
        self.skip_whitespace();
        self.expect('{', "'{'")?;
        let record = self.fields(Mode::Tuple, Some('}'))?;
        self.expect('}', "'}'")?;
        Ok(record)
    }

    /// Parses fields up to (not including) `closing`, or to the end of input when `None`.
    fn fields(
        &mut self,
        mode: Mode,
        closing: Option<char>,
    ) -> Result<DecodedTupleRecord, TupleError> {
        let mut fields = BTreeMap::new();
        loop {
            self.skip_separators();
            match (self.peek(), closing) {
                (None, Some(_)) => return Err(self.expected("'}'")),
                (None, None) => break,
                (Some(c), Some(close)) if c == close => break,
                _ => {}
            }

            let key = self.key()?;
            self.expect(':', "':'")?;
            self.skip_inline_spaces();
            let value = self.value(mode)?;
            if !key.is_empty() {
                fields.insert(key, value);
            }
        }
        Ok(DecodedTupleRecord { fields })
    }

    fn key(&mut self) -> Result<String, TupleError> {
        if matches!(self.peek(), Some('"') | Some('\'')) {
            return self.quoted(|c| c == ':');
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ':' {
                break;
            }
            if c == '}' || c == '\n' || c == '\t' {
                return Err(self.expected("':'"));
            }
            self.pos += 1;
        }
        Ok(self.chars[start..self.pos].iter().collect::<String>().trim().to_owned())
    }

    fn value(&mut self, mode: Mode) -> Result<String, TupleError> {
        if matches!(self.peek(), Some('"') | Some('\'')) {
            return self.quoted(|c| mode.ends_value(c));
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if mode.ends_value(c) {
                break;
            }
            self.pos += 1;
        }
        Ok(self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '"')
            .collect::<String>()
            .trim()
            .to_owned())
    }

    /// Reads a quoted token. `ends` says which characters may follow the closing quote.
    fn quoted(&mut self, ends: impl Fn(char) -> bool) -> Result<String, TupleError> {
        let start = self.pos;
        let Some(quote) = self.peek() else {
            return Err(self.expected("a quoted value"));
        };
        self.pos += 1;

        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(TupleError::UnterminatedString(start)),
                Some(c) if c == quote && self.closes_at(self.pos + 1, &ends) => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some('"') => self.pos += 1,
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    /// True when only inline spaces separate `at` from a terminator or the end of input.
    fn closes_at(&self, mut at: usize, ends: &impl Fn(char) -> bool) -> bool {
        while self.chars.get(at) == Some(&' ') {
            at += 1;
        }
        self.chars.get(at).is_none_or(|c| ends(*c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_tuple_with_tab_separated_fields() {
        let records = decode(
            "[Tuple {answerValue: \"2020-01-01^sys^code^disp^5^mg\"\tfhirField: \"dosage\"\tsourceNote: \"note\"\tvalueType: \"String\"}]",
        )
        .expect("decode");

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.answer_value(), Some("2020-01-01^sys^code^disp^5^mg"));
        assert_eq!(record.fhir_field(), Some("dosage"));
        assert_eq!(record.source_note(), Some("note"));
        assert_eq!(record.value_type(), Some("String"));
        assert_eq!(
            record.answer_segments(),
            vec!["2020-01-01", "sys", "code", "disp", "5", "mg"]
        );
    }

    #[test]
    fn decodes_multiline_list_with_quoted_keys() {
        let input = "[Tuple {\n\t\t\"answerValue\": \"a\"\n\t\t\"sourceNote\": \"first\"\n\t}, Tuple {\n\t\t\"answerValue\": \"b\"\n\t\t\"sourceNote\": \"second\"\n\t\t\"extra\": \"kept\"\n\t}]";
        let records = decode(input).expect("decode");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].answer_value(), Some("a"));
        assert_eq!(records[1].source_note(), Some("second"));
        assert_eq!(records[1].get("extra"), Some("kept"));
        assert_eq!(records[1].fields().len(), 3);
    }

    #[test]
    fn values_keep_embedded_colons_and_commas() {
        let records = decode(
            "[Tuple {sourceNote: \"Seen at 10:30: stable, improving\"\tanswerValue: ratio: 1:2}]",
        )
        .expect("decode");
        assert_eq!(
            records[0].source_note(),
            Some("Seen at 10:30: stable, improving")
        );
        assert_eq!(records[0].answer_value(), Some("ratio: 1:2"));
    }

    #[test]
    fn empty_list_and_empty_tokens() {
        assert!(decode("[]").expect("empty list").is_empty());
        let records = decode("[Tuple {\t\tanswerValue: \"x\"\t\t}]").expect("decode");
        assert_eq!(records[0].fields().len(), 1);
    }

    #[test]
    fn detects_null_sentinel_in_first_segment() {
        let records =
            decode("[Tuple {answerValue: \"null^sys^code\"}, Tuple {answerValue: \"nullable^x\"}]")
                .expect("decode");
        assert!(records[0].is_null_answer());
        assert!(!records[1].is_null_answer());
    }

    #[test]
    fn reports_malformed_input() {
        assert!(matches!(
            decode("[Tuple {answerValue: \"open}]"),
            Err(TupleError::UnterminatedString(_))
        ));
        assert!(matches!(
            decode("[Tuple answerValue: \"x\"}]"),
            Err(TupleError::Expected { expected: "'{'", .. })
        ));
        assert!(matches!(
            decode("[Tuple {answerValue \"x\"}]"),
            Err(TupleError::Expected { .. })
        ));
    }

    #[test]
    fn decodes_key_value_body() {
        let record = decode_key_values(
            "\"answerValue\": \"syphilis, latent\", \"sourceNote\": \"  Dx: syphilis  \", \"answerType\": \"providerassertion\"",
        )
        .expect("decode");
        assert_eq!(record.answer_value(), Some("syphilis, latent"));
        assert_eq!(record.source_note(), Some("  Dx: syphilis  "));
        assert_eq!(record.answer_type(), Some("providerassertion"));

        let braced = decode_key_values("{'answerValue': 'yes'}").expect("decode");
        assert_eq!(braced.answer_value(), Some("yes"));
    }

    #[test]
    fn backslashes_are_kept_and_embedded_quotes_dropped() {
        let records = decode(
            "[Tuple {sourceNote: \"see C:\\notes\\d1 for \"HIV\" result\"\tanswerValue: \"pos\"}]",
        )
        .expect("decode");
        assert_eq!(
            records[0].source_note(),
            Some("see C:\\notes\\d1 for HIV result")
        );
        assert_eq!(records[0].answer_value(), Some("pos"));

        let record = decode_key_values("\"answerValue\": \"a \\d \"b\"\", \"answerType\": \"generic\"")
            .expect("decode");
        assert_eq!(record.answer_value(), Some("a \\d b"));
        assert_eq!(record.answer_type(), Some("generic"));
    }

    #[test]
    fn recognises_tuple_lists() {
        assert!(looks_like_tuple_list("[Tuple {a: b}]"));
        assert!(!looks_like_tuple_list("[]"));
        assert!(!looks_like_tuple_list("42"));
    }
}

use std::collections::HashMap;

use crate::config::ColumnSpec;
use crate::error::ParseError;
use crate::metrics::Registry;
use crate::parser::column::Contribution;

/// The result of successfully parsing one line: the assembled label map
/// (base labels plus any `label`/`request_header` contributions) and the
/// ordered list of `(metric_name, value)` pairs to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub labels: HashMap<String, String>,
    pub values: Vec<(String, f64)>,
}

/// Drives an ordered list of [`crate::parser::ColumnReader`]s (with `null`
/// holes) across one line's whitespace-delimited tokens.
#[derive(Debug, Clone)]
pub struct LineParser {
    columns: Vec<Option<ColumnSpec>>,
    base_labels: Vec<(String, String)>,
}

impl LineParser {
    /// `base_labels` must include at least `environment`; the worker adds
    /// `host` as well. These always win over any same-named column output.
    pub fn new(columns: Vec<Option<ColumnSpec>>, base_labels: Vec<(String, String)>) -> Self {
        Self {
            columns,
            base_labels,
        }
    }

    /// Pure parse: no registry side effects. Exposed directly for unit
    /// testing the schema/tokenizer contract.
    pub fn parse(&self, line: &str) -> Result<ParsedLine, ParseError> {
        let tokens = tokenize(line);
        if tokens.len() < self.columns.len() {
            return Err(ParseError::TooFewTokens);
        }

        let mut labels = HashMap::new();
        let mut values = Vec::new();

        for (column, token) in self.columns.iter().zip(tokens.iter()) {
            let Some(spec) = column else { continue };
            match spec.reader.apply(token)? {
                Contribution::Label { name, value } => {
                    labels.insert(name, value);
                }
                Contribution::Value { metric, value } => {
                    if value < 0.0 {
                        return Err(ParseError::NegativeValue {
                            column: metric,
                            value,
                        });
                    }
                    values.push((metric, value));
                }
                Contribution::RequestHeader {
                    method,
                    path,
                    protocol,
                } => {
                    labels.insert("request_method".to_string(), method);
                    labels.insert("request_path".to_string(), path);
                    labels.insert("request_protocol".to_string(), protocol);
                }
                Contribution::None => {}
            }
        }

        for (name, value) in &self.base_labels {
            labels.insert(name.clone(), value.clone());
        }

        Ok(ParsedLine { labels, values })
    }

    /// Parse `line` and apply its effects to `registry`: one `add` per
    /// emitted `(metric, value)` pair plus `lines_parsed`, or
    /// `parser_errors` on failure. `environment`/`host` are taken from the
    /// parser's base labels.
    pub fn parse_and_record(&self, line: &str, registry: &Registry) -> Result<(), ParseError> {
        let environment = self.base_label("environment");
        let host = self.base_label("host");

        match self.parse(line) {
            Ok(parsed) => {
                for (metric, value) in &parsed.values {
                    registry.add(metric, &parsed.labels, *value);
                }
                registry.inc_reserved_counter("lines_parsed", &environment, &host);
                Ok(())
            }
            Err(err) => {
                registry.inc_reserved_counter("parser_errors", &environment, &host);
                Err(err)
            }
        }
    }

    fn base_label(&self, name: &str) -> String {
        self.base_labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }
}

/// Split a line on runs of ASCII whitespace, ignoring leading/trailing
/// whitespace, with two kinds of group tokenizing: a token opened by an
/// unescaped `"` consumes subsequent tokens until the matching `"` (used by
/// `request`/`request_header`), and a token opened by `[` consumes subsequent
/// tokens until the matching `]` (used by `clf_date`, whose
/// `dd/Mon/YYYY:HH:MM:SS ±ZZZZ` payload itself contains a space). In both
/// cases the enclosing delimiter is stripped and the group becomes a single
/// tokenizer output.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_ascii_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' || c == '[' {
            let closing = if c == '"' { '"' } else { ']' };
            chars.next();
            let mut group = String::new();
            while let Some(&c) = chars.peek() {
                if c == closing {
                    chars.next();
                    break;
                }
                group.push(c);
                chars.next();
            }
            tokens.push(group);
            continue;
        }
        let mut token = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_whitespace() {
                break;
            }
            token.push(c);
            chars.next();
        }
        tokens.push(token);
    }

    tokens
}

//! The finite set of column readers a schema entry can declare.
//!
//! Represented as a tagged variant over a closed set rather than an open
//! trait-object hierarchy: there is no user extension point, so a `match`
//! over a small enum is simpler and cheaper than dynamic dispatch.

use crate::error::ParseError;

/// One non-skipped schema entry. `null` entries are represented as `None` at
/// the call site ([`crate::config::ColumnSpec`] is absent), not as a variant
/// here.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnReader {
    /// Parse the token as a 64-bit float; contributes to a Counter family.
    Number { metric: String },
    /// Common Log Format number: `-` means 0.0; contributes to a Counter.
    ClfNumber { metric: String },
    /// Parse the token as a float and add it to a Histogram family.
    NumberHistogram { metric: String, histogram: String },
    /// CLF-number semantics, added to a Histogram family.
    ClfNumberHistogram { metric: String, histogram: String },
    /// Record the token as the value of a label.
    Label { name: String },
    /// Parse a quoted `METHOD PATH PROTO` group; emits three labels.
    RequestHeader,
    /// Parse a `[dd/Mon/YYYY:HH:MM:SS ±ZZZZ]`-style group; consumed, no
    /// labels or values emitted.
    ClfDate,
}

/// The outcome of applying one [`ColumnReader`] to one token/token-group.
pub(crate) enum Contribution {
    Label { name: String, value: String },
    Value { metric: String, value: f64 },
    RequestHeader {
        method: String,
        path: String,
        protocol: String,
    },
    None,
}

impl ColumnReader {
    pub(crate) fn apply(&self, token: &str) -> Result<Contribution, ParseError> {
        match self {
            ColumnReader::Number { metric } => Ok(Contribution::Value {
                metric: metric.clone(),
                value: parse_number(metric, token)?,
            }),
            ColumnReader::ClfNumber { metric } => Ok(Contribution::Value {
                metric: metric.clone(),
                value: parse_clf_number(metric, token)?,
            }),
            ColumnReader::NumberHistogram { metric, .. } => Ok(Contribution::Value {
                metric: metric.clone(),
                value: parse_number(metric, token)?,
            }),
            ColumnReader::ClfNumberHistogram { metric, .. } => Ok(Contribution::Value {
                metric: metric.clone(),
                value: parse_clf_number(metric, token)?,
            }),
            ColumnReader::Label { name } => Ok(Contribution::Label {
                name: name.clone(),
                value: token.to_string(),
            }),
            ColumnReader::RequestHeader => parse_request_header(token),
            ColumnReader::ClfDate => {
                parse_clf_date(token)?;
                Ok(Contribution::None)
            }
        }
    }
}

fn parse_number(metric: &str, token: &str) -> Result<f64, ParseError> {
    let value: f64 = token.parse().map_err(|_| ParseError::BadNumber {
        column: metric.to_string(),
        token: token.to_string(),
    })?;
    if !value.is_finite() {
        return Err(ParseError::NonFiniteNumber {
            column: metric.to_string(),
            token: token.to_string(),
        });
    }
    Ok(value)
}

fn parse_clf_number(metric: &str, token: &str) -> Result<f64, ParseError> {
    if token == "-" {
        return Ok(0.0);
    }
    parse_number(metric, token)
}

/// Parse a `"METHOD PATH PROTO"` group (quotes already stripped by the
/// tokenizer) into the three request labels.
fn parse_request_header(group: &str) -> Result<Contribution, ParseError> {
    let mut parts = group.split_ascii_whitespace();
    let method = parts.next();
    let path = parts.next();
    let protocol = parts.next();
    match (method, path, protocol) {
        (Some(method), Some(path), Some(protocol)) => Ok(Contribution::RequestHeader {
            method: method.to_string(),
            path: path.to_string(),
            protocol: protocol.to_string(),
        }),
        _ => Err(ParseError::MalformedRequestHeader(group.to_string())),
    }
}

/// Parse (and discard) a `dd/Mon/YYYY:HH:MM:SS ±ZZZZ` group. Validates shape
/// and calendar fields without retaining the value; no label or metric is
/// emitted for it.
fn parse_clf_date(group: &str) -> Result<(), ParseError> {
    chrono::DateTime::parse_from_str(group, "%d/%b/%Y:%H:%M:%S %z")
        .map(|_| ())
        .map_err(|_| ParseError::MalformedClfDate(group.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_rejects_non_finite() {
        let r = ColumnReader::Number {
            metric: "x".into(),
        };
        assert!(matches!(
            r.apply("nan"),
            Err(ParseError::NonFiniteNumber { .. })
        ));
    }

    #[test]
    fn number_rejects_unparseable_token() {
        let r = ColumnReader::Number {
            metric: "x".into(),
        };
        assert!(matches!(
            r.apply("notanumber"),
            Err(ParseError::BadNumber { .. })
        ));
    }

    #[test]
    fn clf_number_dash_is_zero() {
        let r = ColumnReader::ClfNumber {
            metric: "x".into(),
        };
        match r.apply("-").unwrap() {
            Contribution::Value { value, .. } => assert_eq!(value, 0.0),
            _ => panic!("expected value contribution"),
        }
    }

    #[test]
    fn clf_number_passes_through_real_numbers() {
        let r = ColumnReader::ClfNumber {
            metric: "x".into(),
        };
        match r.apply("512").unwrap() {
            Contribution::Value { value, .. } => assert_eq!(value, 512.0),
            _ => panic!("expected value contribution"),
        }
    }

    #[test]
    fn request_header_emits_three_parts() {
        match ColumnReader::RequestHeader
            .apply("GET /index.html HTTP/1.1")
            .unwrap()
        {
            Contribution::RequestHeader {
                method,
                path,
                protocol,
            } => {
                assert_eq!(method, "GET");
                assert_eq!(path, "/index.html");
                assert_eq!(protocol, "HTTP/1.1");
            }
            _ => panic!("expected request header contribution"),
        }
    }

    #[test]
    fn request_header_rejects_short_group() {
        assert!(matches!(
            ColumnReader::RequestHeader.apply("GET /index.html"),
            Err(ParseError::MalformedRequestHeader(_))
        ));
    }

    #[test]
    fn clf_date_accepts_well_formed_group() {
        assert!(parse_clf_date("10/Oct/2023:13:55:36 +0000").is_ok());
    }

    #[test]
    fn clf_date_rejects_malformed_group() {
        assert!(parse_clf_date("not-a-date").is_err());
    }
}

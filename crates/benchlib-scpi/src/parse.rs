//! Strict parsers for SCPI reply tokens.
//!
//! Every parser rejects trailing garbage. Leading whitespace is tolerated
//! for numbers, the way instruments pad short values.

use std::fmt;
use std::str::FromStr;

use benchlib_core::error::Error;

/// Parse a SCPI boolean.
///
/// `1` and anything starting with `y`, `t` or `on` (case-insensitive) is
/// true; `0` and anything starting with `n`, `f` or `off` is false.
/// Everything else is an error, including the empty string and a bare `o`.
pub fn parse_bool(s: &str) -> Result<bool, Error> {
    let starts = |prefix: &str| {
        s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    };

    if s == "1" || starts("y") || starts("t") || starts("on") {
        Ok(true)
    } else if s == "0" || starts("n") || starts("f") || starts("off") {
        Ok(false)
    } else {
        Err(Error::Protocol(format!("invalid boolean '{s}'")))
    }
}

fn parse_number<T: FromStr>(s: &str, what: &str) -> Result<T, Error> {
    s.trim_start()
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid {what} '{s}'")))
}

pub fn parse_int(s: &str) -> Result<i32, Error> {
    parse_number(s, "integer")
}

pub fn parse_float(s: &str) -> Result<f32, Error> {
    parse_number(s, "float")
}

pub fn parse_double(s: &str) -> Result<f64, Error> {
    parse_number(s, "double")
}

pub fn parse_u8(s: &str) -> Result<u8, Error> {
    parse_number(s, "8-bit integer")
}

/// A comma-separated reply where at least one token failed to parse.
///
/// The tokens that did parse are kept in order. `values` is empty when
/// nothing usable arrived at all.
#[derive(Debug)]
pub struct PartialParse<T> {
    pub values: Vec<T>,
    pub error: Error,
}

impl<T> fmt::Display for PartialParse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} values parsed)", self.error, self.values.len())
    }
}

impl<T: fmt::Debug> std::error::Error for PartialParse<T> {}

impl<T> From<PartialParse<T>> for Error {
    fn from(partial: PartialParse<T>) -> Self {
        partial.error
    }
}

/// Parse a comma-separated list, keeping every token that parses.
pub fn parse_list<T>(s: &str, parse: impl Fn(&str) -> Result<T, Error>) -> Result<Vec<T>, PartialParse<T>> {
    let mut values = Vec::new();
    let mut first_error = None;

    for token in s.split(',') {
        match parse(token) {
            Ok(v) => values.push(v),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        None => Ok(values),
        Some(error) => Err(PartialParse { values, error }),
    }
}

//! OpenAPI path templates.
//!
//! Parses templates such as `/users/{id}` or `/files/{name}.json` and matches
//! concrete request paths against them one segment at a time.

use crate::error::ContractError;
use regex::Regex;
use std::collections::HashMap;

/// A parsed path template.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

/// One `/`-delimited piece of a template.
#[derive(Debug, Clone)]
pub enum Segment {
    /// Fixed text, compared for equality
    Literal(String),
    /// A whole-segment parameter such as `{id}`
    Param(String),
    /// Literal text mixed with parameters, such as `{name}.json`
    Pattern(SegmentPattern),
}

/// A mixed segment compiled to an anchored regex.
#[derive(Debug, Clone)]
pub struct SegmentPattern {
    shape: String,
    regex: Regex,
    params: Vec<String>,
}

impl SegmentPattern {
    /// The segment with every parameter replaced by `{}`.
    pub fn shape(&self) -> &str {
        &self.shape
    }

    fn captures(&self, segment: &str) -> Option<Vec<(String, String)>> {
        let caps = self.regex.captures(segment)?;
        let mut values = Vec::with_capacity(self.params.len());
        for (i, name) in self.params.iter().enumerate() {
            let value = caps.get(i + 1)?.as_str();
            values.push((name.clone(), percent_decode(value)));
        }
        Some(values)
    }

    pub(crate) fn is_match(&self, segment: &str) -> bool {
        self.regex.is_match(segment)
    }
}

enum Piece {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    /// Parse a template, rejecting malformed ones.
    pub fn parse(template: &str) -> Result<Self, ContractError> {
        let invalid = |reason: &str| ContractError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let rest = template
            .strip_prefix('/')
            .ok_or_else(|| invalid("must start with '/'"))?;

        let mut segments = Vec::new();
        let mut seen = Vec::<String>::new();
        if !rest.is_empty() {
            for raw_segment in rest.split('/') {
                let pieces = split_pieces(raw_segment).map_err(|reason| invalid(&reason))?;
                for piece in &pieces {
                    if let Piece::Param(name) = piece {
                        if seen.contains(name) {
                            return Err(invalid(&format!("parameter '{}' appears twice", name)));
                        }
                        seen.push(name.clone());
                    }
                }
                segments.push(build_segment(raw_segment, pieces).map_err(|reason| invalid(&reason))?);
            }
        }

        Ok(Self {
            raw: template.to_string(),
            segments,
        })
    }

    /// The template as written in the contract.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Names of all parameters, in order of appearance.
    pub fn param_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Param(name) => names.push(name.as_str()),
                Segment::Pattern(pattern) => names.extend(pattern.params.iter().map(String::as_str)),
                Segment::Literal(_) => {}
            }
        }
        names
    }

    /// Normalised form where every parameter is written `{}`.
    ///
    /// Two templates with the same shape match exactly the same paths.
    pub fn shape(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut shape = String::new();
        for segment in &self.segments {
            shape.push('/');
            match segment {
                Segment::Literal(lit) => shape.push_str(lit),
                Segment::Param(_) => shape.push_str("{}"),
                Segment::Pattern(pattern) => shape.push_str(&pattern.shape),
            }
        }
        shape
    }

    /// Match a concrete path, returning the decoded parameter values.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let concrete = split_path(path)?;
        if concrete.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, value) in self.segments.iter().zip(concrete) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != value {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if value.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), percent_decode(value));
                }
                Segment::Pattern(pattern) => {
                    params.extend(pattern.captures(value)?);
                }
            }
        }
        Some(params)
    }
}

/// Split a request path into segments; `/` has none.
pub(crate) fn split_path(path: &str) -> Option<Vec<&str>> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() {
        return Some(Vec::new());
    }
    Some(rest.split('/').collect())
}

fn split_pieces(segment: &str) -> Result<Vec<Piece>, String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut in_param = false;

    for ch in segment.chars() {
        match ch {
            '{' if in_param => return Err("nested '{'".to_string()),
            '{' => {
                if !current.is_empty() {
                    pieces.push(Piece::Literal(std::mem::take(&mut current)));
                }
                in_param = true;
            }
            '}' if !in_param => return Err("unmatched '}'".to_string()),
            '}' => {
                let name = std::mem::take(&mut current);
                if name.trim().is_empty() {
                    return Err("empty parameter name".to_string());
                }
                pieces.push(Piece::Param(name));
                in_param = false;
            }
            _ => current.push(ch),
        }
    }

    if in_param {
        return Err("unclosed '{'".to_string());
    }
    if !current.is_empty() {
        pieces.push(Piece::Literal(current));
    }
    Ok(pieces)
}

fn build_segment(raw: &str, mut pieces: Vec<Piece>) -> Result<Segment, String> {
    if pieces.is_empty() {
        return Ok(Segment::Literal(String::new()));
    }
    if pieces.len() == 1 {
        return Ok(match pieces.remove(0) {
            Piece::Literal(lit) => Segment::Literal(lit),
            Piece::Param(name) => Segment::Param(name),
        });
    }

    let mut pattern = String::from("^");
    let mut shape = String::new();
    let mut params = Vec::new();
    let mut previous_was_param = false;
    for piece in pieces {
        match piece {
            Piece::Literal(lit) => {
                pattern.push_str(&regex::escape(&lit));
                shape.push_str(&lit);
                previous_was_param = false;
            }
            Piece::Param(name) => {
                if previous_was_param {
                    return Err(format!("adjacent parameters in segment '{}'", raw));
                }
                pattern.push_str("([^/]+?)");
                shape.push_str("{}");
                params.push(name);
                previous_was_param = true;
            }
        }
    }
    pattern.push('$');

    let regex = Regex::new(&pattern).map_err(|e| format!("segment '{}': {}", raw, e))?;
    Ok(Segment::Pattern(SegmentPattern {
        shape,
        regex,
        params,
    }))
}

/// Percent-decode a path segment; invalid escapes are kept verbatim.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

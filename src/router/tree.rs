//! Prefix tree for parameterised paths.
//!
//! Templates are split on `/`. A segment is matched literally unless it is a
//! parameter (`:name` or `{name}`), which binds exactly one path segment, or
//! a wildcard (`*name`), which must come last and binds the remaining path.
//! Matching prefers literal children, then the parameter, then the wildcard,
//! and backtracks when a branch dead-ends.

use std::collections::HashMap;

use super::RouterError;

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Segment<'a> {
    Static(&'a str),
    Param(&'a str),
    Wildcard(&'a str),
}

/// Split a normalised template into segments.
pub(super) fn parse(template: &str) -> Result<Vec<Segment<'_>>, RouterError> {
    let parts: Vec<&str> = segments(template).collect();
    let last = parts.len().saturating_sub(1);
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            let seg = classify(part);
            match seg {
                Segment::Param("") | Segment::Wildcard("") => Err(RouterError::InvalidPattern(template.to_owned())),
                Segment::Wildcard(_) if i != last => Err(RouterError::InvalidPattern(template.to_owned())),
                _ => Ok(seg),
            }
        })
        .collect()
}

fn classify(part: &str) -> Segment<'_> {
    if let Some(name) = part.strip_prefix(':') {
        Segment::Param(name)
    } else if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
        Segment::Param(name)
    } else if let Some(name) = part.strip_prefix('*') {
        Segment::Wildcard(name)
    } else {
        Segment::Static(part)
    }
}

/// Non-empty segments of a path.
pub(super) fn segments(path: &str) -> impl Iterator<Item = &str> { path.split('/').filter(|s| !s.is_empty()) }

/// Whether `template` contains a parameter or wildcard segment.
pub(super) fn is_dynamic(template: &str) -> bool {
    segments(template).any(|part| !matches!(classify(part), Segment::Static(_)))
}

#[derive(Debug)]
pub(super) struct Node<T> {
    value: Option<T>,
    statics: HashMap<String, Node<T>>,
    param: Option<(String, Box<Node<T>>)>,
    wildcard: Option<(String, T)>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            value: None,
            statics: HashMap::new(),
            param: None,
            wildcard: None,
        }
    }
}

impl<T: Clone> Node<T> {
    pub(super) fn insert(&mut self, template: &str, segs: &[Segment<'_>], value: T) -> Result<(), RouterError> {
        let Some((first, rest)) = segs.split_first() else {
            if self.value.is_some() {
                return Err(RouterError::DuplicateRoute(template.to_owned()));
            }
            self.value = Some(value);
            return Ok(());
        };
        match *first {
            Segment::Static(part) => self
                .statics
                .entry(part.to_owned())
                .or_default()
                .insert(template, rest, value),
            Segment::Param(name) => {
                let (bound, child) = self
                    .param
                    .get_or_insert_with(|| (name.to_owned(), Box::default()));
                if bound.as_str() != name {
                    return Err(RouterError::Conflict(template.to_owned()));
                }
                child.insert(template, rest, value)
            }
            Segment::Wildcard(name) => match &self.wildcard {
                Some((bound, _)) if bound == name => Err(RouterError::DuplicateRoute(template.to_owned())),
                Some(_) => Err(RouterError::Conflict(template.to_owned())),
                None => {
                    self.wildcard = Some((name.to_owned(), value));
                    Ok(())
                }
            },
        }
    }

    /// Value for `path`, pushing bound parameters onto `params`.
    pub(super) fn find(&self, path: &[&str], params: &mut Vec<(String, String)>) -> Option<T> {
        let Some((first, rest)) = path.split_first() else {
            if let Some(value) = &self.value {
                return Some(value.clone());
            }
            return self.wildcard.as_ref().map(|(name, value)| {
                params.push((name.clone(), String::new()));
                value.clone()
            });
        };
        if let Some(found) = self.statics.get(*first).and_then(|child| child.find(rest, params)) {
            return Some(found);
        }
        if let Some((name, child)) = &self.param {
            let mark = params.len();
            params.push((name.clone(), (*first).to_owned()));
            if let Some(found) = child.find(rest, params) {
                return Some(found);
            }
            params.truncate(mark);
        }
        self.wildcard.as_ref().map(|(name, value)| {
            params.push((name.clone(), path.join("/")));
            value.clone()
        })
    }
}

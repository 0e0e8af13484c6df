pub use http::{header::HeaderName, uri::Scheme, Method, StatusCode};
use regex::Regex;
use std::num::NonZeroU16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRouteMatch {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub method: Option<Method>,
}

#[derive(Clone, Debug)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

#[derive(Clone, Debug)]
pub enum HeaderMatch {
    Exact(HeaderName, String),
    Regex(HeaderName, Regex),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestRedirectFilter {
    pub scheme: Option<Scheme>,
    pub host: Option<String>,
    pub path: Option<PathModifier>,
    pub port: Option<NonZeroU16>,
    pub status: Option<StatusCode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathModifier {
    Full(String),
    Prefix(String),
}

// === impl HttpRouteMatch ===

impl Default for HttpRouteMatch {
    /// Matches every request.
    fn default() -> Self {
        Self {
            path: PathMatch::Prefix("/".to_string()),
            headers: vec![],
            method: None,
        }
    }
}

impl HttpRouteMatch {
    /// Two matches are identical when they select exactly the same requests,
    /// regardless of the order in which header matches were declared.
    pub fn is_identical(&self, other: &Self) -> bool {
        if self.path != other.path || self.method != other.method {
            return false;
        }
        if self.headers.len() != other.headers.len() {
            return false;
        }
        self.headers.iter().all(|h| other.headers.contains(h))
    }
}

// === impl PathMatch ===

impl PartialEq for PathMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(l0), Self::Exact(r0)) => l0 == r0,
            (Self::Prefix(l0), Self::Prefix(r0)) => l0 == r0,
            (Self::Regex(l0), Self::Regex(r0)) => l0.as_str() == r0.as_str(),
            _ => false,
        }
    }
}

impl Eq for PathMatch {}

impl PathMatch {
    pub fn regex(s: &str) -> Result<Self, regex::Error> {
        Ok(Self::Regex(Regex::new(s)?))
    }

    /// Ranks match kinds from most to least specific.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Exact(_) => 0,
            Self::Prefix(_) => 1,
            Self::Regex(_) => 2,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Exact(s) | Self::Prefix(s) => s,
            Self::Regex(r) => r.as_str(),
        }
    }
}

// === impl HeaderMatch ===

impl PartialEq for HeaderMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(n0, v0), Self::Exact(n1, v1)) => n0 == n1 && v0 == v1,
            (Self::Regex(n0, r0), Self::Regex(n1, r1)) => n0 == n1 && r0.as_str() == r1.as_str(),
            _ => false,
        }
    }
}

impl Eq for HeaderMatch {}

impl HeaderMatch {
    pub fn name(&self) -> &HeaderName {
        match self {
            Self::Exact(name, _) | Self::Regex(name, _) => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_ignores_header_order() {
        let a = HttpRouteMatch {
            path: PathMatch::Exact("/foo".to_string()),
            headers: vec![
                HeaderMatch::Exact(HeaderName::from_static("x-a"), "1".to_string()),
                HeaderMatch::Exact(HeaderName::from_static("x-b"), "2".to_string()),
            ],
            method: None,
        };
        let mut b = a.clone();
        b.headers.reverse();
        assert!(a.is_identical(&b));

        b.method = Some(Method::GET);
        assert!(!a.is_identical(&b));
    }

    #[test]
    fn regex_paths_compare_by_source() {
        assert_eq!(
            PathMatch::regex("/v[0-9]+").unwrap(),
            PathMatch::regex("/v[0-9]+").unwrap()
        );
        assert_ne!(
            PathMatch::regex("/v[0-9]+").unwrap(),
            PathMatch::Prefix("/v[0-9]+".to_string())
        );
    }
}

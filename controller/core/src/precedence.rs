use crate::ir::Route;
use std::{cmp::Ordering, fmt, str::FromStr};

/// Orders overlapping routes on a listener.
///
/// Keys are compared in order until one of them differs. The route's own
/// identity (namespace, name, rule index, match index) is always used as the
/// final key so that the resulting order is total.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePrecedence(Vec<PrecedenceKey>);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrecedenceKey {
    /// Exact paths before prefixes before regular expressions, then longer
    /// paths, then more header matches, then routes that match a method.
    Specificity,
    /// Older routes first. Routes without a timestamp sort last.
    Created,
    /// Lexicographic by namespace and then name.
    Name,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParsePrecedenceError {
    #[error("unknown precedence key {0:?}; expected one of 'specificity', 'created', or 'name'")]
    UnknownKey(String),

    #[error("precedence key {0} listed more than once")]
    Duplicate(PrecedenceKey),

    #[error("at least one precedence key is required")]
    Empty,
}

// === impl RoutePrecedence ===

impl Default for RoutePrecedence {
    fn default() -> Self {
        Self(vec![
            PrecedenceKey::Specificity,
            PrecedenceKey::Created,
            PrecedenceKey::Name,
        ])
    }
}

impl RoutePrecedence {
    pub fn keys(&self) -> &[PrecedenceKey] {
        &self.0
    }

    pub fn compare(&self, a: &Route, b: &Route) -> Ordering {
        self.0
            .iter()
            .fold(Ordering::Equal, |ord, key| ord.then_with(|| key.compare(a, b)))
            .then_with(|| a.id.cmp(&b.id))
    }

    /// Sorts routes and assigns each its priority, starting at zero.
    pub fn sort(&self, routes: &mut [Route]) {
        routes.sort_by(|a, b| self.compare(a, b));
        for (priority, route) in routes.iter_mut().enumerate() {
            route.priority = priority as u32;
        }
    }
}

impl FromStr for RoutePrecedence {
    type Err = ParsePrecedenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut keys = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let key = part.parse::<PrecedenceKey>()?;
            if keys.contains(&key) {
                return Err(ParsePrecedenceError::Duplicate(key));
            }
            keys.push(key);
        }
        if keys.is_empty() {
            return Err(ParsePrecedenceError::Empty);
        }
        Ok(Self(keys))
    }
}

impl fmt::Display for RoutePrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            fmt::Display::fmt(key, f)?;
        }
        Ok(())
    }
}

// === impl PrecedenceKey ===

impl PrecedenceKey {
    fn compare(&self, a: &Route, b: &Route) -> Ordering {
        match self {
            Self::Specificity => {
                let (a, b) = (&a.matches, &b.matches);
                a.path
                    .rank()
                    .cmp(&b.path.rank())
                    .then_with(|| b.path.as_str().len().cmp(&a.path.as_str().len()))
                    .then_with(|| b.headers.len().cmp(&a.headers.len()))
                    .then_with(|| b.method.is_some().cmp(&a.method.is_some()))
            }
            Self::Created => match (a.creation_timestamp, b.creation_timestamp) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
            Self::Name => a.id.route.cmp(&b.id.route),
        }
    }
}

impl FromStr for PrecedenceKey {
    type Err = ParsePrecedenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "specificity" => Ok(Self::Specificity),
            "created" | "creation" | "age" => Ok(Self::Created),
            "name" => Ok(Self::Name),
            _ => Err(ParsePrecedenceError::UnknownKey(s.to_string())),
        }
    }
}

impl fmt::Display for PrecedenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Specificity => "specificity",
            Self::Created => "created",
            Self::Name => "name",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http_route::{HeaderMatch, HeaderName, HttpRouteMatch, PathMatch, StatusCode},
        ir::{RouteAction, RouteId},
        ObjectId,
    };
    use chrono::{DateTime, Utc};

    fn route(name: &str, path: PathMatch, created: i64) -> Route {
        Route {
            id: RouteId {
                route: ObjectId::new("ns", name),
                rule: 0,
                match_index: 0,
            },
            creation_timestamp: DateTime::<Utc>::from_timestamp(created, 0),
            hostnames: vec![],
            matches: HttpRouteMatch {
                path,
                headers: vec![],
                method: None,
            },
            action: RouteAction::Fail {
                status: StatusCode::INTERNAL_SERVER_ERROR,
            },
            policies: vec![],
            priority: 0,
        }
    }

    fn names(routes: &[Route]) -> Vec<&str> {
        routes.iter().map(|r| r.id.route.name.as_str()).collect()
    }

    #[test]
    fn exact_before_prefix_before_regex() {
        let mut routes = vec![
            route("regex", PathMatch::regex("/foo.*").unwrap(), 0),
            route("prefix", PathMatch::Prefix("/foo".to_string()), 0),
            route("exact", PathMatch::Exact("/foo".to_string()), 0),
        ];
        RoutePrecedence::default().sort(&mut routes);
        assert_eq!(names(&routes), ["exact", "prefix", "regex"]);
        assert_eq!(
            routes.iter().map(|r| r.priority).collect::<Vec<_>>(),
            [0, 1, 2]
        );
    }

    #[test]
    fn longer_prefixes_and_more_headers_first() {
        let mut with_header = route("hdr", PathMatch::Prefix("/a".to_string()), 0);
        with_header.matches.headers.push(HeaderMatch::Exact(
            HeaderName::from_static("x-env"),
            "prod".to_string(),
        ));
        let mut routes = vec![
            route("short", PathMatch::Prefix("/a".to_string()), 0),
            with_header,
            route("long", PathMatch::Prefix("/a/b".to_string()), 0),
        ];
        RoutePrecedence::default().sort(&mut routes);
        assert_eq!(names(&routes), ["long", "hdr", "short"]);
    }

    #[test]
    fn ties_break_on_age_then_name() {
        let path = || PathMatch::Prefix("/".to_string());
        let mut routes = vec![
            route("b", path(), 10),
            route("c", path(), 5),
            route("a", path(), 10),
        ];
        RoutePrecedence::default().sort(&mut routes);
        assert_eq!(names(&routes), ["c", "a", "b"]);
    }

    #[test]
    fn order_is_configurable() {
        let precedence = "created,specificity".parse::<RoutePrecedence>().unwrap();
        let mut routes = vec![
            route("exact", PathMatch::Exact("/x".to_string()), 20),
            route("prefix", PathMatch::Prefix("/".to_string()), 10),
        ];
        precedence.sort(&mut routes);
        assert_eq!(names(&routes), ["prefix", "exact"]);
        assert_eq!(precedence.to_string(), "created,specificity");
    }

    #[test]
    fn rejects_bad_keys() {
        assert_eq!(
            "specificity,bogus".parse::<RoutePrecedence>(),
            Err(ParsePrecedenceError::UnknownKey("bogus".to_string()))
        );
        assert_eq!(
            "name,name".parse::<RoutePrecedence>(),
            Err(ParsePrecedenceError::Duplicate(PrecedenceKey::Name))
        );
        assert_eq!(
            " , ".parse::<RoutePrecedence>(),
            Err(ParsePrecedenceError::Empty)
        );
    }
}

//! Resolution of user supplied identifiers (full ID, short ID or name) to
//! container objects.
use crate::runtime::{ContainerRecord, Runtime, RuntimeError};

#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("empty container identifier")]
    EmptyRequest,
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("multiple IDs found with provided prefix: {request} ({count} matches)")]
    Ambiguous { request: String, count: usize },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("{}", .0.join("\n"))]
    Multiple(Vec<String>),
}

/// One resolved container.
#[derive(Debug, Clone)]
pub struct Found<'r> {
    pub container: ContainerRecord,
    pub request: &'r str,
    /// Number of containers the request resolved to. Greater than one
    /// means the request is an ambiguous ID prefix.
    pub match_count: usize,
}

impl Found<'_> {
    pub fn ensure_unique(&self) -> Result<(), WalkError> {
        if self.match_count > 1 {
            return Err(WalkError::Ambiguous {
                request: self.request.to_owned(),
                count: self.match_count,
            });
        }
        Ok(())
    }
}

pub struct ContainerWalker<'a> {
    runtime: &'a dyn Runtime,
}

impl<'a> ContainerWalker<'a> {
    pub fn new(runtime: &'a dyn Runtime) -> Self {
        Self { runtime }
    }

    /// Resolves `request` and calls `on_found` once per match, stopping at
    /// the first error. Returns the number of matches; zero means nothing
    /// matched and `on_found` was never called.
    ///
    /// An exact full ID or an exact name always resolves to a single
    /// container. Only when neither matches are IDs scanned by prefix.
    pub fn walk<F, E>(&self, request: &str, mut on_found: F) -> Result<usize, E>
    where
        F: FnMut(Found<'_>) -> Result<(), E>,
        E: From<WalkError>,
    {
        if request.is_empty() {
            return Err(WalkError::EmptyRequest.into());
        }
        let containers = self.runtime.containers().map_err(WalkError::from)?;

        let exact = containers
            .iter()
            .position(|c| c.id == request)
            .or_else(|| containers.iter().position(|c| c.name() == request));
        let matches: Vec<ContainerRecord> = match exact {
            Some(index) => vec![containers[index].clone()],
            None => containers
                .into_iter()
                .filter(|c| c.id.starts_with(request))
                .collect(),
        };

        let match_count = matches.len();
        tracing::trace!(request, match_count, "resolved container identifier");
        for container in matches {
            on_found(Found {
                container,
                request,
                match_count,
            })?;
        }
        Ok(match_count)
    }

    /// Resolves `request` to exactly one container.
    pub fn resolve_unique(&self, request: &str) -> Result<ContainerRecord, WalkError> {
        let mut resolved = None;
        let count = self.walk(request, |found| -> Result<(), WalkError> {
            found.ensure_unique()?;
            resolved = Some(found.container);
            Ok(())
        })?;
        match resolved {
            Some(container) if count == 1 => Ok(container),
            _ => Err(WalkError::NotFound(request.to_owned())),
        }
    }

    /// Walks every request in turn. Without `continue_on_error` the first
    /// failure is returned at once. Otherwise every request is attempted
    /// and the failures are reported together; a request matching nothing
    /// counts as a failure.
    pub fn walk_all<F, E>(
        &self,
        requests: &[String],
        continue_on_error: bool,
        mut on_found: F,
    ) -> Result<(), E>
    where
        F: FnMut(Found<'_>) -> Result<(), E>,
        E: From<WalkError> + std::fmt::Display,
    {
        let mut errors: Vec<E> = Vec::new();
        for request in requests {
            let result = match self.walk(request, &mut on_found) {
                Ok(0) => Err(WalkError::NotFound(request.clone()).into()),
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if !continue_on_error {
                    return Err(err);
                }
                tracing::error!(request = request.as_str(), %err, "failed to process container");
                errors.push(err);
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(WalkError::Multiple(errors.iter().map(ToString::to_string).collect()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeRuntime;
    use anyhow::Result;

    fn runtime() -> FakeRuntime {
        FakeRuntime::default()
            .with_container("ab12cd", "web")
            .with_container("ab34ef", "db")
            .with_container("ff00aa", "ab")
    }

    #[test]
    fn test_walk_prefix_ambiguity() {
        let runtime = runtime();
        let walker = ContainerWalker::new(&runtime);

        let mut calls = Vec::new();
        let result = walker.walk("ab3", |found| -> Result<(), WalkError> {
            calls.push((found.container.id.clone(), found.match_count));
            found.ensure_unique()
        });
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls, vec![("ab34ef".to_owned(), 1)]);

        let mut calls = Vec::new();
        let result = walker.walk("ab", |found| -> Result<(), WalkError> {
            calls.push(found.match_count);
            found.ensure_unique()
        });
        // "ab" is also the name of ff00aa, which wins as an exact match.
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls, vec![1]);
    }

    #[test]
    fn test_walk_ambiguous_prefix_reports_count() {
        let runtime = FakeRuntime::default()
            .with_container("ab12cd", "web")
            .with_container("ab34ef", "db");
        let walker = ContainerWalker::new(&runtime);

        let mut calls = 0;
        let result = walker.walk("ab", |found| -> Result<(), WalkError> {
            calls += 1;
            assert_eq!(found.match_count, 2);
            found.ensure_unique()
        });
        assert!(matches!(result, Err(WalkError::Ambiguous { count: 2, .. })));
        assert_eq!(calls, 1);

        assert_eq!(walker.walk("ab12", |_| Ok::<_, WalkError>(())).unwrap(), 1);

        let mut called = false;
        let count = walker
            .walk("zz", |_| -> Result<(), WalkError> {
                called = true;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 0);
        assert!(!called);
    }

    #[test]
    fn test_walk_exact_id_beats_prefix() {
        let runtime = FakeRuntime::default()
            .with_container("ab", "short")
            .with_container("abcdef", "long");
        let walker = ContainerWalker::new(&runtime);
        let container = walker.resolve_unique("ab").unwrap();
        assert_eq!(container.id, "ab");
    }

    #[test]
    fn test_walk_by_name() {
        let runtime = runtime();
        let walker = ContainerWalker::new(&runtime);
        assert_eq!(walker.resolve_unique("db").unwrap().id, "ab34ef");
        assert!(matches!(walker.resolve_unique("nope"), Err(WalkError::NotFound(_))));
        assert!(matches!(
            walker.walk("", |_| Ok::<_, WalkError>(())),
            Err(WalkError::EmptyRequest)
        ));
    }

    #[test]
    fn test_walk_all_continue_on_error() -> Result<()> {
        let runtime = FakeRuntime::default()
            .with_container("aaaa11", "a")
            .with_container("bbbb22", "b");
        let walker = ContainerWalker::new(&runtime);

        let requests = vec!["a".to_owned(), "missing".to_owned(), "b".to_owned()];
        let mut seen = Vec::new();
        let result = walker.walk_all(&requests, true, |found| -> Result<(), WalkError> {
            seen.push(found.container.id.clone());
            Ok(())
        });
        assert_eq!(seen, vec!["aaaa11".to_owned(), "bbbb22".to_owned()]);
        let err = result.unwrap_err();
        assert!(matches!(err, WalkError::NotFound(ref r) if r == "missing"));

        let mut seen = Vec::new();
        let result = walker.walk_all(&requests, false, |found| -> Result<(), WalkError> {
            seen.push(found.container.id.clone());
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(seen, vec!["aaaa11".to_owned()]);
        Ok(())
    }

    #[test]
    fn test_walk_all_aggregates() {
        let runtime = FakeRuntime::default().with_container("aaaa11", "a");
        let walker = ContainerWalker::new(&runtime);
        let requests = vec!["x".to_owned(), "a".to_owned(), "y".to_owned()];
        let err = walker
            .walk_all(&requests, true, |_| Ok::<_, WalkError>(()))
            .unwrap_err();
        match err {
            WalkError::Multiple(errors) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains('x'));
                assert!(errors[1].contains('y'));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}

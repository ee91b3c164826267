//! Accumulating validation result.
//!
//! Unlike `Result`, combining two failed validations keeps the errors of
//! both sides, so a caller sees every problem in one pass instead of only
//! the first one.

/// Outcome of a validation that gathers all errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation<T, E> {
    Success(T),
    /// Never empty when produced by this module.
    Failure(Vec<E>),
}

impl<T, E> Validation<T, E> {
    pub fn success(value: T) -> Self {
        Validation::Success(value)
    }

    pub fn failure(error: E) -> Self {
        Validation::Failure(vec![error])
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Validation::Success(_))
    }

    /// Errors collected so far; empty on success.
    pub fn errors(&self) -> &[E] {
        match self {
            Validation::Success(_) => &[],
            Validation::Failure(errors) => errors,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Validation<U, E> {
        match self {
            Validation::Success(value) => Validation::Success(f(value)),
            Validation::Failure(errors) => Validation::Failure(errors),
        }
    }

    /// Pairs two validations. Errors of both sides are appended in order.
    pub fn zip<U>(self, other: Validation<U, E>) -> Validation<(T, U), E> {
        match (self, other) {
            (Validation::Success(a), Validation::Success(b)) => Validation::Success((a, b)),
            (Validation::Failure(mut a), Validation::Failure(b)) => {
                a.extend(b);
                Validation::Failure(a)
            }
            (Validation::Failure(a), Validation::Success(_)) => Validation::Failure(a),
            (Validation::Success(_), Validation::Failure(b)) => Validation::Failure(b),
        }
    }

    pub fn into_result(self) -> Result<T, Vec<E>> {
        match self {
            Validation::Success(value) => Ok(value),
            Validation::Failure(errors) => Err(errors),
        }
    }
}

impl<T, E> From<Result<T, E>> for Validation<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Validation::Success(value),
            Err(error) => Validation::failure(error),
        }
    }
}

impl<T, E> FromIterator<Validation<T, E>> for Validation<Vec<T>, E> {
    fn from_iter<I: IntoIterator<Item = Validation<T, E>>>(iter: I) -> Self {
        let mut values = Vec::new();
        let mut errors = Vec::new();
        for item in iter {
            match item {
                Validation::Success(value) => values.push(value),
                Validation::Failure(e) => errors.extend(e),
            }
        }
        if errors.is_empty() {
            Validation::Success(values)
        } else {
            Validation::Failure(errors)
        }
    }
}

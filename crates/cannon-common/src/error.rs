use std::fmt;

/// Collects errors from batch operations, typically one per consumer.
///
/// A single collected error renders as that error alone; several render
/// as an indented list, so the common one-failure case stays readable.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: anyhow::Error) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Ok when nothing was collected, otherwise self as the error.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "no errors"),
            [single] => write!(f, "{single:#}"),
            many => {
                write!(f, "multiple errors:")?;
                for error in many {
                    write!(f, "\n\t- {error:#}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

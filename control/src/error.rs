use crate::annotations::AnnotationError;
use crate::proxy::api::ApiError;
use crate::proxy::certs::CertError;
use thiserror::Error;

/// Tollgate Control Plane Errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("configuration API error: {0}")]
    Api(#[from] ApiError),

    #[error("certificate error: {0}")]
    Certificate(#[from] CertError),

    #[error(transparent)]
    Annotation(#[from] AnnotationError),

    #[error("service '{namespace}/{name}' not found")]
    ServiceNotFound { namespace: String, name: String },

    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("service '{namespace}/{name}' has no port '{port}'")]
    ServicePortNotFound {
        namespace: String,
        name: String,
        port: String,
    },

    #[error("invalid reference '{0}': expected <namespace>/<name>")]
    InvalidReference(String),

    #[error("rule error: {0}")]
    Rule(String),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<ControllerError>),

    #[error("Kubernetes error: {0}")]
    Kubernetes(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collects errors from independent steps that should all be attempted
#[derive(Debug, Default)]
pub struct Errors(Vec<ControllerError>);

impl Errors {
    pub fn add<E: Into<ControllerError>>(&mut self, result: Result<(), E>) {
        if let Err(e) = result {
            self.0.push(e.into());
        }
    }

    pub fn into_result(mut self) -> Result<(), ControllerError> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(ControllerError::Multiple(self.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_empty_is_ok() {
        let mut errors = Errors::default();
        errors.add(Ok::<(), ControllerError>(()));
        assert!(errors.into_result().is_ok());
    }

    #[test]
    fn test_errors_single_is_unwrapped() {
        let mut errors = Errors::default();
        errors.add(Err(ControllerError::InvalidReference("bad".to_string())));
        let err = errors.into_result().unwrap_err();
        assert!(matches!(err, ControllerError::InvalidReference(_)));
    }

    #[test]
    fn test_errors_multiple_are_joined() {
        let mut errors = Errors::default();
        errors.add(Err(ControllerError::NamespaceNotFound("a".to_string())));
        errors.add(Err(ControllerError::NamespaceNotFound("b".to_string())));
        let err = errors.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "namespace 'a' not found; namespace 'b' not found"
        );
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Yaml Error: {0}")]
    YamlError(#[source] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("IO Error: {0}")]
    IoError(std::io::Error),

    #[error("Certificate Error: {0}")]
    CertificateError(#[source] rcgen::Error),

    #[error("Invalid Certificate: {0}")]
    InvalidCertificate(String),

    /// The namespace is not part of the watched set, so no cache exists for it
    #[error("no lister for namespace {0}")]
    NoCacheForNamespace(String),

    #[error("could not sync informer cache: {0}")]
    CacheSyncTimeout(String),

    #[error("Invalid Certificate Definition: {0}")]
    InvalidDefinition(String),

    /// NB: this is a catch-all for any other errors
    #[error("Other Error: {0}")]
    OtherError(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The API server answered 404 for the requested object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// A create raced with another writer and the object is already there
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::KubeError(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    /// An update carried a stale resource version
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::KubeError(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "Conflict"
        )
    }
}

pub mod cert_manager;
pub mod certrotation;
pub mod config;
pub mod events_helper;
pub mod helper;
pub mod store;

/// Log and trace integrations
pub mod telemetry;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: String::new(),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn api_errors_are_classified() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!api_error(404, "NotFound").is_already_exists());
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(409, "Conflict").is_already_exists());
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(!api_error(409, "AlreadyExists").is_conflict());
        assert!(!Error::OtherError("x".into()).is_not_found());
    }
}

/// The coordinator server error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured storage could not be set up
    #[error("storage: {0}")]
    Storage(String),
    /// Cannot find the certificate or key file
    #[error("reading certificate files: {0}")]
    CertificateError(#[source] std::io::Error),
    /// Cannot start the HTTP server
    #[error("starting server: {0}")]
    Server(#[source] std::io::Error),
}

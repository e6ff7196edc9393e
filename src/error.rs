use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub(crate) enum ServerError {
    #[error("Invalid host key path {0}")]
    InvalidKeyPath(PathBuf),
}

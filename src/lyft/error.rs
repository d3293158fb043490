use std::path::PathBuf;
use thiserror::Error;

pub type SegResult<T> = Result<T, SegError>;

#[derive(Debug, Error)]
pub enum SegError {
    #[error("param should be train or val, got {split:?}")]
    InvalidSplit { split: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("label {path} is {label:?} but its image is {image:?} (width, height)")]
    ShapeMismatch {
        path: PathBuf,
        image: (u32, u32),
        label: (u32, u32),
    },
    #[error("unknown sample {0}")]
    UnknownSample(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("model error: {0}")]
    Model(String),
}

impl SegError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SegError::Io { path: path.into(), source }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        SegError::Image { path: path.into(), source }
    }
}

impl From<ort::Error> for SegError {
    fn from(error: ort::Error) -> Self {
        SegError::Model(error.to_string())
    }
}

#[cfg(feature = "torch")]
impl From<tch::TchError> for SegError {
    fn from(error: tch::TchError) -> Self {
        SegError::Model(error.to_string())
    }
}

impl From<serde_json::Error> for SegError {
    fn from(error: serde_json::Error) -> Self {
        SegError::Config(error.to_string())
    }
}

use crate::artifact::ArtifactError;

/// Errors surfaced by the analysis pipeline.
#[derive(thiserror::Error, Debug)]
pub enum VqaError {
    /// The image bytes could not be decoded as a raster.
    #[error("failed to decode image: {0}")]
    InputDecode(#[from] image::ImageError),

    #[error(transparent)]
    Image(#[from] kornia_image::ImageError),

    #[error("invalid generation config: {0}")]
    InvalidConfig(String),

    /// The model runtime failed while preparing, generating or decoding.
    #[error("generation failed: {0}")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The model panicked while answering. The engine keeps serving.
    #[error("generation panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("the inference engine is not running")]
    EngineStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VqaError {
    pub(crate) fn model<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        VqaError::Model(Box::new(err))
    }

    pub(crate) fn panicked(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        VqaError::Panicked(message)
    }
}

use crate::data_loader::DataLoaderError;
use crate::engine::InferenceError;
use crate::orchestrator::Phase;
use imagenetpostprocessor::ClassificationError;
use imagenetpreprocessor::PreprocessError;

pub type Result<T> = std::result::Result<T, ClassifierError>;

/// How an error is surfaced to the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Surface {
    /// Replaces the whole view; the pipeline is finished.
    FullScreen,
    /// Shown next to the input, dismissible; everything else stays as it was.
    Inline,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("WebAssembly is not available in this environment")]
    UnsupportedEnvironment,

    #[error(transparent)]
    Handshake(DataLoaderError),

    #[error(transparent)]
    Download(DataLoaderError),

    #[error("Failed to load model: {0}")]
    ModelLoad(#[source] InferenceError),

    #[error("{0}")]
    ImageTooLarge(#[source] PreprocessError),

    #[error("{0}")]
    ImageDecode(#[source] PreprocessError),

    #[error("Inference failed: {0}")]
    Inference(#[source] InferenceError),

    #[error("Unreadable inference output: {0}")]
    Output(#[from] ClassificationError),

    #[error("operation not possible while {0:?}")]
    NotReady(Phase),

    #[error("input was replaced while inference was running")]
    StaleResult,

    #[error("a newer image replaced this one while it was being prepared")]
    Superseded,

    #[error("pipeline was already started")]
    AlreadyStarted,
}

impl From<DataLoaderError> for ClassifierError {
    fn from(error: DataLoaderError) -> Self {
        if error.is_handshake() {
            ClassifierError::Handshake(error)
        } else {
            ClassifierError::Download(error)
        }
    }
}

impl From<PreprocessError> for ClassifierError {
    fn from(error: PreprocessError) -> Self {
        match error {
            PreprocessError::ImageTooLarge { .. } => ClassifierError::ImageTooLarge(error),
            _ => ClassifierError::ImageDecode(error),
        }
    }
}

impl ClassifierError {
    /// Terminal errors end the lifecycle; the only way out is a restart.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClassifierError::UnsupportedEnvironment
                | ClassifierError::Handshake(_)
                | ClassifierError::Download(_)
                | ClassifierError::ModelLoad(_)
        )
    }

    pub fn surface(&self) -> Surface {
        if self.is_terminal() {
            Surface::FullScreen
        } else {
            Surface::Inline
        }
    }

    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            ClassifierError::UnsupportedEnvironment => "WebAssembly is not available in this environment. \
                 Please use a host that supports WebAssembly."
                .to_string(),
            ClassifierError::Handshake(_) | ClassifierError::Download(_) => {
                format!("Error: {}. Restart to try again.", self)
            }
            ClassifierError::ModelLoad(_) => {
                format!("Error: {}. Restart to download the model again.", self)
            }
            ClassifierError::ImageTooLarge(PreprocessError::ImageTooLarge { limit, .. }) => {
                format!(
                    "The image is too large. Please choose an image under {}.",
                    human_size(*limit)
                )
            }
            ClassifierError::ImageTooLarge(_) => {
                "The image is too large. Please choose a smaller image.".to_string()
            }
            ClassifierError::ImageDecode(_) => {
                "The image could not be read. Please choose a different image.".to_string()
            }
            ClassifierError::Inference(_) | ClassifierError::Output(_) => {
                format!("{}. You can retry or choose a different image.", self)
            }
            ClassifierError::StaleResult => {
                "A new image was selected; run the classification again.".to_string()
            }
            ClassifierError::Superseded => {
                "A newer image was selected and replaced this one.".to_string()
            }
            ClassifierError::NotReady(_) | ClassifierError::AlreadyStarted => self.to_string(),
        }
    }
}

/// Byte count in the largest whole binary unit, e.g. `5 MB` for 5 MiB.
fn human_size(bytes: usize) -> String {
    const KIB: usize = 1024;
    const MIB: usize = 1024 * KIB;

    match bytes {
        0 => "0 bytes".to_string(),
        b if b % MIB == 0 => format!("{} MB", b / MIB),
        b if b % KIB == 0 => format!("{} KB", b / KIB),
        b => format!("{} bytes", b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn loader_errors_split_by_stage() {
        let handshake: ClassifierError =
            DataLoaderError::HandshakeError("403 Forbidden".into()).into();
        let download: ClassifierError = DataLoaderError::Timeout(Duration::from_secs(1)).into();

        assert!(matches!(handshake, ClassifierError::Handshake(_)));
        assert!(matches!(download, ClassifierError::Download(_)));
        assert!(handshake.to_string().contains("403 Forbidden"));
    }

    #[test]
    fn pipeline_errors_are_full_screen() {
        for error in [
            ClassifierError::UnsupportedEnvironment,
            ClassifierError::Handshake(DataLoaderError::HandshakeError("x".into())),
            ClassifierError::Download(DataLoaderError::Cancelled),
            ClassifierError::ModelLoad(InferenceError::GraphNotFound(0)),
        ] {
            assert!(error.is_terminal());
            assert_eq!(error.surface(), Surface::FullScreen);
        }
    }

    #[test]
    fn input_errors_are_inline() {
        let too_large: ClassifierError = PreprocessError::ImageTooLarge { size: 10, limit: 5 }.into();
        let corrupt: ClassifierError = PreprocessError::ImageDecodeError("eof".into()).into();

        assert!(matches!(too_large, ClassifierError::ImageTooLarge(_)));
        assert!(matches!(corrupt, ClassifierError::ImageDecode(_)));
        for error in [
            too_large,
            corrupt,
            ClassifierError::Inference(InferenceError::Timeout(Duration::from_secs(1))),
            ClassifierError::NotReady(Phase::Downloading),
        ] {
            assert!(!error.is_terminal());
            assert_eq!(error.surface(), Surface::Inline);
        }
    }

    #[test]
    fn size_message_follows_the_configured_limit() {
        let error: ClassifierError = PreprocessError::ImageTooLarge {
            size: 3 * 1024 * 1024,
            limit: 2 * 1024 * 1024,
        }
        .into();
        assert_eq!(
            error.user_message(),
            "The image is too large. Please choose an image under 2 MB."
        );

        let error: ClassifierError = PreprocessError::ImageTooLarge {
            size: 8192,
            limit: 4096,
        }
        .into();
        assert!(error.user_message().ends_with("under 4 KB."));

        let error: ClassifierError = PreprocessError::ImageTooLarge { size: 10, limit: 5 }.into();
        assert!(error.user_message().ends_with("under 5 bytes."));
    }
}

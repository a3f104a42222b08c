use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvertError>;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("unrecognized query shape: {0}")]
    UnrecognizedShape(String),

    #[error("unsupported OR group: {0}")]
    UnsupportedOrGroup(String),

    #[error("unsupported combination: {0}")]
    UnsupportedCombination(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("unknown template type: {0}")]
    UnknownTemplateKind(String),

    #[error("unrecognized templating query: {0}")]
    UnrecognizedTemplatingShape(String),

    #[error("condition does not match selected field: {0}")]
    AmbiguousLabelFilter(String),

    #[error("alert mapping missing for notification {0}")]
    NotificationMappingMissing(String),

    #[error("dashboard '{title}' is invalid: {source}")]
    InvalidDashboard {
        title: String,
        #[source]
        source: Box<ConvertError>,
    },

    #[error("malformed dashboard JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConvertError {
    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Self::UnrecognizedShape(message.into())
    }

    /// Templating failures abort the whole dashboard; everything else is
    /// contained by the panel that produced it.
    pub fn is_dashboard_fatal(&self) -> bool {
        matches!(
            self,
            ConvertError::UnknownTemplateKind(_)
                | ConvertError::UnrecognizedTemplatingShape(_)
                | ConvertError::InvalidDashboard { .. }
        )
    }
}

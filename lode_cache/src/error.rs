use thiserror::Error;

/// Failure taxonomy for the loader pipeline.
///
/// Errors are `Clone` because a single settled load signal fans out to every
/// consumer of a shared cache entry.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// Network or file fetch failure
    #[error("Failed to fetch {uri}: {reason}")]
    Fetch { uri: String, reason: String },

    /// Invalid magic bytes, malformed JSON, unsupported version
    #[error("{context}: {reason}")]
    Format { context: String, reason: String },

    /// Image or geometry decode failure
    #[error("{context}: {reason}")]
    Decode { context: String, reason: String },

    /// A child loader this loader depends on failed
    #[error("{context}")]
    Dependency {
        context: String,
        #[source]
        source: Box<ResourceError>,
    },

    /// The loader was destroyed before its load settled
    #[error("Loader was destroyed before completion")]
    Destroyed,
}

impl ResourceError {
    pub fn fetch(uri: impl Into<String>, reason: impl ToString) -> Self {
        ResourceError::Fetch {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    pub fn format(context: impl Into<String>, reason: impl ToString) -> Self {
        ResourceError::Format {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(context: impl Into<String>, reason: impl ToString) -> Self {
        ResourceError::Decode {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Annotate a child loader's failure with this loader's context
    pub fn dependency(context: impl Into<String>, source: ResourceError) -> Self {
        ResourceError::Dependency {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

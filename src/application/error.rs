use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::render::RenderError, config::LoadError, domain::frame::FrameError,
    infra::error::InfraError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// The error followed by each of its sources, outermost first.
    pub fn chain(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut current = self.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_lists_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let err = AppError::from(InfraError::bind("127.0.0.1:9000", io));
        let chain = err.chain();

        assert_eq!(chain[0], "failed to bind 127.0.0.1:9000: port taken");
        assert_eq!(chain.last().map(String::as_str), Some("port taken"));
    }
}

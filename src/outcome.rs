use serde::Serialize;
use tracing::error;

use crate::error::MusicError;

/// Uniform result shape handed to front-ends.
#[derive(Debug, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub code: Option<&'static str>,
}

impl<T> Outcome<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn failure(err: &MusicError) -> Self {
        if !err.is_expected() {
            error!("music operation failed: {err}");
        }
        Self {
            success: false,
            data: None,
            error: Some(err.user_message()),
            code: Some(err.code()),
        }
    }

    pub fn message_or(&self, render: impl FnOnce(&T) -> String) -> String {
        match (&self.data, &self.error) {
            (Some(data), _) => render(data),
            (None, Some(err)) => err.clone(),
            (None, None) => "Done.".to_string(),
        }
    }
}

impl<T> From<Result<T, MusicError>> for Outcome<T> {
    fn from(res: Result<T, MusicError>) -> Self {
        match res {
            Ok(data) => Outcome::success(data),
            Err(e) => Outcome::failure(&e),
        }
    }
}

//! Raw byte fetching for audio sources

use crate::error::{Error, Result};
use crate::source::is_data_uri;
use base64::{engine::general_purpose, Engine as _};
use futures::future::{BoxFuture, FutureExt};
use std::path::PathBuf;
use tracing::debug;

/// Produces the encoded bytes of a source
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, source: &str) -> BoxFuture<'static, Result<Vec<u8>>>;
}

/// Fetches `data:` URIs and local files
///
/// `file://` prefixes are accepted. Network URLs are rejected with
/// [`Error::Fetch`].
#[derive(Debug, Clone, Default)]
pub struct DefaultFetcher;

impl DefaultFetcher {
    pub fn new() -> Self {
        Self
    }

    fn decode_data_uri(source: &str) -> Result<Vec<u8>> {
        let payload = source
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or_else(|| Error::Fetch {
                uri: abbreviate(source),
                reason: "malformed data URI".to_string(),
            })?;

        general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| Error::Fetch {
                uri: abbreviate(source),
                reason: format!("invalid base64 payload: {}", e),
            })
    }
}

/// Data URIs can be megabytes long; keep log and error text readable
fn abbreviate(source: &str) -> String {
    const MAX: usize = 48;
    match source.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &source[..cut]),
        None => source.to_string(),
    }
}

impl SourceFetcher for DefaultFetcher {
    fn fetch(&self, source: &str) -> BoxFuture<'static, Result<Vec<u8>>> {
        if is_data_uri(source) {
            let result = Self::decode_data_uri(source);
            return async move { result }.boxed();
        }

        if source.contains("://") && !source.starts_with("file://") {
            let uri = abbreviate(source);
            return async move {
                Err(Error::Fetch {
                    uri,
                    reason: "network sources are not supported".to_string(),
                })
            }
            .boxed();
        }

        let path = PathBuf::from(source.strip_prefix("file://").unwrap_or(source));
        let uri = source.to_string();
        async move {
            debug!("Reading source file {}", path.display());
            tokio::fs::read(&path).await.map_err(|e| Error::Fetch {
                uri,
                reason: e.to_string(),
            })
        }
        .boxed()
    }
}

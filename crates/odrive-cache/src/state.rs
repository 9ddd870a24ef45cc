use serde::Serialize;

/// Lifecycle state of one ciphertext file, encoded as its suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Being written by an upload
    Uploading,
    /// Complete locally, not yet in the blob store
    Uploaded,
    /// Complete locally and durable in the blob store
    Cached,
    /// Being refilled from the blob store
    Caching,
    /// Complete, but its metadata commit failed
    Orphaned,
}

impl FileState {
    pub const ALL: [FileState; 5] = [
        FileState::Uploading,
        FileState::Uploaded,
        FileState::Cached,
        FileState::Caching,
        FileState::Orphaned,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            FileState::Uploading => ".uploading",
            FileState::Uploaded => ".uploaded",
            FileState::Cached => ".cached",
            FileState::Caching => ".caching",
            FileState::Orphaned => ".orphaned",
        }
    }

    /// Split `<connector>.<state>` into its parts.
    pub fn parse_file_name(name: &str) -> Option<(&str, FileState)> {
        FileState::ALL.iter().find_map(|state| {
            name.strip_suffix(state.suffix())
                .filter(|connector| !connector.is_empty())
                .map(|connector| (connector, *state))
        })
    }

    /// A readable copy exists in this state.
    pub fn is_complete(self) -> bool {
        matches!(self, FileState::Uploaded | FileState::Cached)
    }
}

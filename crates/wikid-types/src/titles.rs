//! Reserved titles, tags, and defaults of the TiddlyWeb protocol.

/// Tag that marks a tiddler as a macro definition. Macro tiddlers are always
/// listed with their text so the client can execute them.
pub const MACRO_TAG: &str = "$:/tags/Macro";

/// Per-window story river state.
pub const STORY_LIST: &str = "$:/StoryList";

/// Per-window navigation history.
pub const HISTORY_LIST: &str = "$:/HistoryList";

/// Synthetic tiddler carrying the server time of the request.
pub const SYNC_TIME: &str = "$:/sync-time";

/// Synthetic tiddler carrying the client address of the request.
pub const CLIENT_IP: &str = "$:/client-ip";

/// Tag applied to synthetic tiddlers.
pub const AUTO_GENERATED_TAG: &str = "auto-generated";

/// Content type assumed when a tiddler carries none.
pub const DEFAULT_TYPE: &str = "text/vnd.tiddlywiki";

/// Custom field pointing at an externally stored attachment.
pub const CANONICAL_URI_FIELD: &str = "_canonical_uri";

/// Returns `true` for per-window state tiddlers that are only synced when
/// explicitly enabled.
pub fn is_story_state(title: &str) -> bool {
    title == STORY_LIST || title == HISTORY_LIST
}

/// Returns `true` for titles the server synthesizes per request.
pub fn is_synthetic(title: &str) -> bool {
    title == SYNC_TIME || title == CLIENT_IP
}

/// Errors from session store operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Every generated token collided with a live session.
    #[error("no free session token after {attempts} attempts")]
    TokenSpaceExhausted { attempts: u32 },
}

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

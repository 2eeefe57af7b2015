use rand::RngCore;

/// Produces candidate session tokens.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> String;
}

/// Hex-encoded bytes from the thread-local CSPRNG.
#[derive(Clone, Copy, Debug)]
pub struct RandomTokens {
    bytes: usize,
}

impl RandomTokens {
    /// Tokens of `bytes` random bytes (twice as many hex characters).
    pub fn new(bytes: usize) -> Self {
        Self { bytes }
    }
}

impl Default for RandomTokens {
    fn default() -> Self {
        Self::new(18)
    }
}

impl TokenSource for RandomTokens {
    fn token(&self) -> String {
        let mut buf = vec![0u8; self.bytes];
        rand::thread_rng().fill_bytes(&mut buf);
        hex::encode(buf)
    }
}

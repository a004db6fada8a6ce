//! Credential provider boundary. The real OAuth/login exchange is out of
//! scope; [`StaticCredentialProvider`] reads a token already present in the
//! config store and observes invalidation signals from the rest of the
//! pipeline.

use std::sync::atomic::{AtomicBool, Ordering};

pub trait CredentialProvider: Send + Sync {
    fn token(&self) -> Option<String>;
    fn invalidate(&self);
}

pub struct StaticCredentialProvider {
    config: std::sync::Arc<crate::config::Config>,
    invalidated: AtomicBool,
}

impl StaticCredentialProvider {
    pub fn new(config: std::sync::Arc<crate::config::Config>) -> Self {
        Self {
            config,
            invalidated: AtomicBool::new(false),
        }
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn token(&self) -> Option<String> {
        if self.invalidated.load(Ordering::SeqCst) {
            return None;
        }
        let token = self.config.get_string("auth/access_token", "");
        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    }

    fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.config.invalidate_auth_token();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn invalidate_clears_token_until_next_rewrite() {
        let path = std::env::temp_dir().join("box-scanner-auth-test.toml");
        std::fs::write(&path, "[auth]\naccess_token = \"abc\"\n").unwrap();
        let config = Arc::new(crate::config::Config::load(&path).unwrap());
        let provider = StaticCredentialProvider::new(config);
        assert_eq!(provider.token(), Some("abc".to_string()));
        provider.invalidate();
        assert_eq!(provider.token(), None);
        std::fs::remove_file(path).ok();
    }
}

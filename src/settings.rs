use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Token/domain pair handed to the tunnel supervisor when the relay is asked
/// to expose itself externally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelCredentials {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub domain: String,
}

/// Credential store consumed by the API surface and the tunnel supervisor.
pub trait SettingsStore: Send + Sync {
    fn get(&self) -> TunnelCredentials;
    fn update(&self, credentials: TunnelCredentials);
}

#[derive(Default)]
pub struct MemorySettingsStore {
    inner: RwLock<TunnelCredentials>,
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self) -> TunnelCredentials {
        self.inner.read().expect("settings poisoned").clone()
    }

    fn update(&self, credentials: TunnelCredentials) {
        *self.inner.write().expect("settings poisoned") = credentials;
    }
}

/// Masks a token for API responses: keep the first and last four characters
/// when the token is long enough, otherwise hide it entirely. Counted in
/// characters, not bytes, so multi-byte tokens never split mid-character.
pub fn mask_token(token: &str) -> String {
    let count = token.chars().count();
    if count > 8 {
        let head: String = token.chars().take(4).collect();
        let tail: String = token.chars().skip(count - 4).collect();
        format!("{}****{}", head, tail)
    } else if !token.is_empty() {
        "****".to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token(""), "");
        assert_eq!(mask_token("short"), "****");
        assert_eq!(mask_token("12345678"), "****");
        assert_eq!(mask_token("abcd1234wxyz"), "abcd****wxyz");
    }

    #[test]
    fn test_mask_token_multibyte() {
        // Byte index 4 lands inside the second 'é'; must not panic.
        assert_eq!(mask_token("aééééé"), "****");
        assert_eq!(mask_token("ééééé1234"), "éééé****1234");
        assert_eq!(mask_token("日本語トークン長い値"), "日本語ト****ン長い値");
    }

    #[test]
    fn test_store_round_trip() {
        let store = MemorySettingsStore::default();
        assert!(store.get().token.is_empty());

        store.update(TunnelCredentials {
            token: "tok".to_string(),
            domain: "relay.example.com".to_string(),
        });
        let creds = store.get();
        assert_eq!(creds.token, "tok");
        assert_eq!(creds.domain, "relay.example.com");
    }
}

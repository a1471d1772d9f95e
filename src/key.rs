use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use log::debug;

use crate::errors::JoinError;

/// Identity carried through the inference job: `base64(phone_token)|interaction_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub phone_token: String,
    pub interaction_id: Option<String>,
}

impl CompositeKey {
    pub fn new(phone_token: &str, interaction_id: Option<&str>) -> Self {
        Self { phone_token: phone_token.to_string(), interaction_id: interaction_id.map(str::to_string) }
    }

    pub fn encode(&self) -> String {
        let token = STANDARD.encode(self.phone_token.as_bytes());
        match &self.interaction_id {
            Some(id) => format!("{}|{}", token, id),
            None => token,
        }
    }

    /// A key without `|` is a bare encoded phone token.
    pub fn decode(key: &str) -> Result<Self, JoinError> {
        let (token_part, interaction_id) = match key.split_once('|') {
            Some((token, id)) => (token, Some(id.trim()).filter(|id| !id.is_empty())),
            None => (key, None),
        };
        let fail = |reason: String| JoinError::KeyDecode { key: key.to_string(), reason };
        let token_part = token_part.trim();
        if token_part.is_empty() {
            return Err(fail("empty phone token".to_string()));
        }
        let bytes = STANDARD.decode(token_part)
            .or_else(|_| URL_SAFE.decode(token_part))
            .map_err(|e| fail(e.to_string()))?;
        let phone_token = String::from_utf8(bytes).map_err(|e| fail(e.to_string()))?;
        debug!("Decoded composite key '{}' -> phone_token '{}', interaction {:?}", key, phone_token, interaction_id);
        Ok(Self { phone_token, interaction_id: interaction_id.map(str::to_string) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_is_reversible() {
        let key = CompositeKey::new("tok-555-0101", Some("INT-9"));
        assert_eq!(key.encode(), "dG9rLTU1NS0wMTAx|INT-9");
        assert_eq!(CompositeKey::decode(&key.encode()).unwrap(), key);
    }

    #[test]
    fn bare_token_has_no_interaction() {
        let key = CompositeKey::decode("dG9rLTU1NS0wMTAx").unwrap();
        assert_eq!(key.phone_token, "tok-555-0101");
        assert_eq!(key.interaction_id, None);
        assert_eq!(CompositeKey::decode("dG9rLTU1NS0wMTAx|").unwrap().interaction_id, None);
    }

    #[test]
    fn invalid_base64_is_an_error() {
        assert!(matches!(CompositeKey::decode("not base64!|x"), Err(JoinError::KeyDecode { .. })));
        assert!(matches!(CompositeKey::decode("|x"), Err(JoinError::KeyDecode { .. })));
    }
}

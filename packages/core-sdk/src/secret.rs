use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use thiserror::Error;

const ENCRYPTED_PREFIX: &str = "enc:v1:";
const ENCODED_PREFIX: &str = "b64:";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret key must be base64 of 32 bytes")]
    InvalidKey,
    #[error("stored secret is encrypted but no secret key is configured")]
    MissingKey,
    #[error("stored secret envelope is invalid: {0}")]
    InvalidEnvelope(String),
    #[error("secret cipher failure")]
    Cipher,
}

/**
 * \brief 凭据密文编解码器。
 * \details 配置主密钥时使用 ChaCha20-Poly1305 认证加密，信封格式为
 *          `enc:v1:<nonce>:<ciphertext>`；未配置时退化为可逆的 base64 编码
 *          （`b64:` 前缀），仅防止明文直接外露，不提供机密性。
 */
#[derive(Clone, Default)]
pub struct SecretCodec {
    key: Option<[u8; 32]>,
}

impl SecretCodec {
    /** \brief 不加密的编解码器（仅 base64）。 */
    pub fn plain() -> Self {
        Self { key: None }
    }

    pub fn with_key(key: [u8; 32]) -> Self {
        Self { key: Some(key) }
    }

    /**
     * \brief 从 base64 形式的主密钥构造；None 表示未配置。
     */
    pub fn from_config(encoded_key: Option<&str>) -> Result<Self, SecretError> {
        let Some(encoded) = encoded_key else {
            return Ok(Self::plain());
        };
        let raw = STANDARD
            .decode(encoded.trim())
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded.trim()))
            .map_err(|_| SecretError::InvalidKey)?;
        let key: [u8; 32] = raw.try_into().map_err(|_| SecretError::InvalidKey)?;
        Ok(Self::with_key(key))
    }

    pub fn is_encrypting(&self) -> bool {
        self.key.is_some()
    }

    /**
     * \brief 编码明文密钥以便持久化。
     */
    pub fn encode(&self, plaintext: &str) -> Result<String, SecretError> {
        let Some(key) = self.key.as_ref() else {
            return Ok(format!("{ENCODED_PREFIX}{}", STANDARD.encode(plaintext)));
        };
        let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| SecretError::InvalidKey)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SecretError::Cipher)?;
        Ok(format!(
            "{ENCRYPTED_PREFIX}{}:{}",
            URL_SAFE_NO_PAD.encode(nonce.as_slice()),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /**
     * \brief 解码持久化的密钥。
     */
    pub fn decode(&self, stored: &str) -> Result<String, SecretError> {
        if let Some(body) = stored.strip_prefix(ENCODED_PREFIX) {
            let raw = STANDARD
                .decode(body)
                .map_err(|e| SecretError::InvalidEnvelope(e.to_string()))?;
            return String::from_utf8(raw).map_err(|e| SecretError::InvalidEnvelope(e.to_string()));
        }

        let Some(body) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Err(SecretError::InvalidEnvelope("unknown prefix".to_string()));
        };
        let key = self.key.as_ref().ok_or(SecretError::MissingKey)?;
        let (nonce_b64, ciphertext_b64) = body
            .split_once(':')
            .ok_or_else(|| SecretError::InvalidEnvelope("missing separator".to_string()))?;
        let nonce_raw = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|e| SecretError::InvalidEnvelope(e.to_string()))?;
        if nonce_raw.len() != NONCE_LEN {
            return Err(SecretError::InvalidEnvelope("nonce length".to_string()));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64)
            .map_err(|e| SecretError::InvalidEnvelope(e.to_string()))?;

        let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| SecretError::InvalidKey)?;
        let plaintext = aead
            .decrypt(Nonce::from_slice(&nonce_raw), ciphertext.as_ref())
            .map_err(|_| SecretError::Cipher)?;
        String::from_utf8(plaintext).map_err(|e| SecretError::InvalidEnvelope(e.to_string()))
    }
}

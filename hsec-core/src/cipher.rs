//! Cipher service: AES-256-CBC with PKCS7 padding, P-256 ECDH key agreement.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;

/// Raw public key length on the wire: X || Y, no SEC1 tag byte.
pub const RAW_PUBLIC_KEY_LEN: usize = 64;

const SEC1_UNCOMPRESSED_TAG: u8 = 0x04;

/// Pad to the next block boundary (a full block when already aligned), then AES-256-CBC encrypt.
pub fn aes_encrypt(plain: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CipherError> {
    check_key_iv(key, iv)?;
    let enc = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CipherError::KeyLength)?;
    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plain))
}

/// Decrypt and strip PKCS7 padding. The padding is validated strictly: length must be a
/// block multiple, the pad byte in 1..=16, and every pad byte equal to the pad length.
pub fn aes_decrypt(cipher: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CipherError> {
    check_key_iv(key, iv)?;
    if cipher.is_empty() || cipher.len() % BLOCK_LEN != 0 {
        return Err(CipherError::BlockLength(cipher.len()));
    }
    let dec = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CipherError::KeyLength)?;
    dec.decrypt_padded_vec_mut::<Pkcs7>(cipher)
        .map_err(|_| CipherError::Padding)
}

fn check_key_iv(key: &[u8], iv: &[u8]) -> Result<(), CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::KeyLength);
    }
    if iv.len() != IV_LEN {
        return Err(CipherError::IvLength);
    }
    Ok(())
}

/// Session key material. By protocol convention the IV is the first 16 bytes of the shared secret.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SessionKeys {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    pub fn from_shared_secret(secret: &[u8; KEY_LEN]) -> Self {
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&secret[..IV_LEN]);
        Self { key: *secret, iv }
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        aes_encrypt(plain, &self.key, &self.iv)
    }

    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, CipherError> {
        aes_decrypt(cipher, &self.key, &self.iv)
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Ephemeral P-256 key pair. The private half never leaves this struct.
pub struct EcdhKeypair {
    secret: SecretKey,
    public: [u8; RAW_PUBLIC_KEY_LEN],
}

impl EcdhKeypair {
    /// Generate a key pair from the OS entropy source.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let point = secret.public_key().to_encoded_point(false);
        let mut public = [0u8; RAW_PUBLIC_KEY_LEN];
        // Uncompressed SEC1 is 0x04 || X || Y.
        public.copy_from_slice(&point.as_bytes()[1..]);
        Self { secret, public }
    }

    /// Raw `X || Y` public key as sent in the client hello.
    pub fn public_key(&self) -> &[u8; RAW_PUBLIC_KEY_LEN] {
        &self.public
    }

    /// X coordinate of the shared point. Fails if the peer key is not on the curve.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<[u8; KEY_LEN], CipherError> {
        let peer = parse_public_key(peer_public)?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

/// Accept raw `X || Y` (64 bytes) or any SEC1 encoding.
fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, CipherError> {
    let parsed = if bytes.len() == RAW_PUBLIC_KEY_LEN {
        let mut sec1 = Vec::with_capacity(RAW_PUBLIC_KEY_LEN + 1);
        sec1.push(SEC1_UNCOMPRESSED_TAG);
        sec1.extend_from_slice(bytes);
        PublicKey::from_sec1_bytes(&sec1)
    } else {
        PublicKey::from_sec1_bytes(bytes)
    };
    parsed.map_err(|_| CipherError::InvalidPublicKey)
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    #[error("key must be 32 bytes")]
    KeyLength,
    #[error("iv must be 16 bytes")]
    IvLength,
    #[error("ciphertext length {0} is not a non-zero multiple of 16")]
    BlockLength(usize),
    #[error("invalid padding")]
    Padding,
    #[error("invalid peer public key")]
    InvalidPublicKey,
}

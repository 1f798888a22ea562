use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use tracing::{debug, error};

use crate::{Error, Result};

pub const ENVELOPE_MAGIC: &[u8; 4] = b"KSCC";
pub const FRAMING_VERSION: u8 = 0x01;
pub const SALT_LEN: usize = 16;
pub const ACCOUNT_TAG_LEN: usize = 32;
pub const NONCE_PREFIX_LEN: usize = 16;
pub const NONCE_LEN: usize = 24;
pub const AEAD_TAG_LEN: usize = 16;
pub const FRAME_PLAINTEXT_LEN: usize = 4096;
pub const HEADER_LEN: usize = 4 + 1 + 4 + SALT_LEN + ACCOUNT_TAG_LEN + NONCE_PREFIX_LEN;

pub const KDF_DEFAULT_ITERATIONS: u32 = 200_000;
pub const KDF_MIN_ITERATIONS: u32 = 10_000;
pub const KDF_MAX_ITERATIONS: u32 = 1_000_000;

const ACCOUNT_TAG_CONTEXT: &str = "keepsake 2024 backup envelope account binding v1";

#[derive(Debug, Clone, PartialEq, Eq)]
struct EnvelopeHeader {
    iterations: u32,
    salt: [u8; SALT_LEN],
    account_tag: [u8; ACCOUNT_TAG_LEN],
    nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl EnvelopeHeader {
    fn encode(&self) -> [u8; HEADER_LEN] {
        let tag_at = 9 + SALT_LEN;
        let prefix_at = tag_at + ACCOUNT_TAG_LEN;
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(ENVELOPE_MAGIC);
        out[4] = FRAMING_VERSION;
        out[5..9].copy_from_slice(&self.iterations.to_be_bytes());
        out[9..tag_at].copy_from_slice(&self.salt);
        out[tag_at..prefix_at].copy_from_slice(&self.account_tag);
        out[prefix_at..].copy_from_slice(&self.nonce_prefix);
        out
    }

    fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        if &bytes[0..4] != ENVELOPE_MAGIC {
            return Err(Error::incompatible("not an encrypted backup envelope"));
        }
        if bytes[4] != FRAMING_VERSION {
            return Err(Error::incompatible(format!(
                "unsupported envelope version: {}",
                bytes[4]
            )));
        }
        let mut iterations = [0u8; 4];
        iterations.copy_from_slice(&bytes[5..9]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[9..9 + SALT_LEN]);
        let tag_at = 9 + SALT_LEN;
        let mut account_tag = [0u8; ACCOUNT_TAG_LEN];
        account_tag.copy_from_slice(&bytes[tag_at..tag_at + ACCOUNT_TAG_LEN]);
        let prefix_at = tag_at + ACCOUNT_TAG_LEN;
        let mut nonce_prefix = [0u8; NONCE_PREFIX_LEN];
        nonce_prefix.copy_from_slice(&bytes[prefix_at..prefix_at + NONCE_PREFIX_LEN]);

        Ok(Self {
            iterations: u32::from_be_bytes(iterations),
            salt,
            account_tag,
            nonce_prefix,
        })
    }
}

fn account_tag(salt: &[u8; SALT_LEN], account_id: &str) -> [u8; ACCOUNT_TAG_LEN] {
    let mut material = Vec::with_capacity(SALT_LEN + account_id.len());
    material.extend_from_slice(salt);
    material.extend_from_slice(account_id.as_bytes());
    blake3::derive_key(ACCOUNT_TAG_CONTEXT, &material)
}

fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN], iterations: u32) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut out);
    out
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u64) -> XNonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    *XNonce::from_slice(&nonce)
}

fn frame_aad(header: &[u8; HEADER_LEN], is_final: bool) -> [u8; HEADER_LEN + 1] {
    let mut aad = [0u8; HEADER_LEN + 1];
    aad[..HEADER_LEN].copy_from_slice(header);
    aad[HEADER_LEN] = u8::from(is_final);
    aad
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut out = [0u8; N];
    getrandom::getrandom(&mut out).map_err(|e| Error::Unknown {
        message: format!("getrandom failed: {e}"),
    })?;
    Ok(out)
}

/// Fills `buf` from `source` until it is full or the source is exhausted.
fn read_up_to<R: Read>(source: &mut R, buf: &mut Vec<u8>, limit: usize) -> Result<()> {
    buf.clear();
    buf.resize(limit, 0);
    let mut filled = 0;
    while filled < limit {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    buf.truncate(filled);
    Ok(())
}

pub fn validate_kdf_iterations(iterations: u32) -> Result<()> {
    if !(KDF_MIN_ITERATIONS..=KDF_MAX_ITERATIONS).contains(&iterations) {
        return Err(Error::InvalidConfig {
            message: format!(
                "kdf iterations must be within {KDF_MIN_ITERATIONS}..={KDF_MAX_ITERATIONS} (got {iterations})"
            ),
        });
    }
    Ok(())
}

/// Passphrase-keyed streaming cipher whose envelopes are bound to one account id.
///
/// Envelope layout:
/// `"KSCC" | version | kdf iterations (u32 BE) | salt | account tag | nonce prefix | frames`,
/// where each frame is a big-endian `u32` length followed by an XChaCha20-Poly1305
/// ciphertext of at most [`FRAME_PLAINTEXT_LEN`] plaintext bytes. Every frame
/// authenticates the full header and whether it is the last frame.
#[derive(Debug, Clone, Copy)]
pub struct PassphraseCipher {
    kdf_iterations: u32,
}

impl Default for PassphraseCipher {
    fn default() -> Self {
        Self {
            kdf_iterations: KDF_DEFAULT_ITERATIONS,
        }
    }
}

impl PassphraseCipher {
    pub fn new(kdf_iterations: u32) -> Result<Self> {
        validate_kdf_iterations(kdf_iterations)?;
        Ok(Self { kdf_iterations })
    }

    pub fn kdf_iterations(&self) -> u32 {
        self.kdf_iterations
    }

    pub fn encrypt<R: Read, W: Write>(
        &self,
        mut source: R,
        mut sink: W,
        account_id: &str,
        passphrase: &str,
    ) -> Result<u64> {
        if passphrase.is_empty() {
            return Err(Error::InvalidConfig {
                message: "backup passphrase must not be empty".to_string(),
            });
        }

        let salt = random_bytes::<SALT_LEN>()?;
        let header = EnvelopeHeader {
            iterations: self.kdf_iterations,
            salt,
            account_tag: account_tag(&salt, account_id),
            nonce_prefix: random_bytes::<NONCE_PREFIX_LEN>()?,
        };
        let header_bytes = header.encode();
        let key = derive_key(passphrase, &salt, self.kdf_iterations);
        let cipher = XChaCha20Poly1305::new((&key).into());

        sink.write_all(&header_bytes)?;
        let mut written = HEADER_LEN as u64;

        let mut current = Vec::with_capacity(FRAME_PLAINTEXT_LEN);
        let mut next = Vec::with_capacity(FRAME_PLAINTEXT_LEN);
        read_up_to(&mut source, &mut current, FRAME_PLAINTEXT_LEN)?;

        let mut counter = 0u64;
        loop {
            if current.len() == FRAME_PLAINTEXT_LEN {
                read_up_to(&mut source, &mut next, FRAME_PLAINTEXT_LEN)?;
            } else {
                next.clear();
            }
            let is_final = next.is_empty();

            let aad = frame_aad(&header_bytes, is_final);
            let ciphertext = cipher
                .encrypt(
                    &frame_nonce(&header.nonce_prefix, counter),
                    Payload {
                        msg: &current,
                        aad: &aad,
                    },
                )
                .map_err(|_| Error::Unknown {
                    message: "frame encryption failed".to_string(),
                })?;
            let len = u32::try_from(ciphertext.len()).map_err(|_| Error::Unknown {
                message: "frame too large".to_string(),
            })?;
            sink.write_all(&len.to_be_bytes())?;
            sink.write_all(&ciphertext)?;
            written += 4 + ciphertext.len() as u64;

            if is_final {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            counter += 1;
        }

        sink.flush()?;
        debug!(
            event = "crypto.encrypted",
            frames = counter + 1,
            bytes = written,
            "crypto.encrypted"
        );
        Ok(written)
    }

    /// Decrypts an envelope into `sink`, returning the plaintext length.
    ///
    /// The account tag is checked before the key is derived: a mismatch is
    /// `InvalidUserId`, any authentication failure is `Decryption`.
    pub fn decrypt<R: Read, W: Write>(
        &self,
        mut source: R,
        mut sink: W,
        account_id: &str,
        passphrase: &str,
    ) -> Result<u64> {
        let mut header_bytes = [0u8; HEADER_LEN];
        source.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::decryption("envelope header is truncated")
            } else {
                e.into()
            }
        })?;
        let header = EnvelopeHeader::decode(&header_bytes)?;
        if !(KDF_MIN_ITERATIONS..=KDF_MAX_ITERATIONS).contains(&header.iterations) {
            return Err(Error::decryption(format!(
                "envelope kdf iterations out of range: {}",
                header.iterations
            )));
        }

        let expected = blake3::Hash::from(account_tag(&header.salt, account_id));
        if expected != blake3::Hash::from(header.account_tag) {
            error!(event = "crypto.account_mismatch", "crypto.account_mismatch");
            return Err(Error::InvalidUserId);
        }

        let key = derive_key(passphrase, &header.salt, header.iterations);
        let cipher = XChaCha20Poly1305::new((&key).into());

        let mut plaintext_len = 0u64;
        let mut counter = 0u64;
        let mut frame = Vec::with_capacity(FRAME_PLAINTEXT_LEN + AEAD_TAG_LEN);
        loop {
            let mut len_bytes = [0u8; 4];
            source.read_exact(&mut len_bytes).map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    Error::decryption("envelope is truncated")
                } else {
                    e.into()
                }
            })?;
            let len = u32::from_be_bytes(len_bytes) as usize;
            if !(AEAD_TAG_LEN..=FRAME_PLAINTEXT_LEN + AEAD_TAG_LEN).contains(&len) {
                return Err(Error::decryption(format!("invalid frame length: {len}")));
            }
            frame.resize(len, 0);
            source.read_exact(&mut frame).map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    Error::decryption("envelope frame is truncated")
                } else {
                    e.into()
                }
            })?;

            let nonce = frame_nonce(&header.nonce_prefix, counter);
            let open = |is_final: bool| {
                let aad = frame_aad(&header_bytes, is_final);
                cipher.decrypt(
                    &nonce,
                    Payload {
                        msg: &frame,
                        aad: &aad,
                    },
                )
            };
            let (plain, is_final) = match open(false) {
                Ok(plain) => (plain, false),
                Err(_) => match open(true) {
                    Ok(plain) => (plain, true),
                    Err(_) => {
                        error!(
                            event = "crypto.frame_auth_failed",
                            frame = counter,
                            "crypto.frame_auth_failed"
                        );
                        return Err(Error::decryption(
                            "wrong passphrase or corrupted backup",
                        ));
                    }
                },
            };

            sink.write_all(&plain)?;
            plaintext_len += plain.len() as u64;

            if is_final {
                let mut trailing = [0u8; 1];
                if source.read(&mut trailing)? != 0 {
                    return Err(Error::decryption("unexpected data after final frame"));
                }
                break;
            }
            counter += 1;
        }

        sink.flush()?;
        debug!(
            event = "crypto.decrypted",
            frames = counter + 1,
            bytes = plaintext_len,
            "crypto.decrypted"
        );
        Ok(plaintext_len)
    }

    pub fn encrypt_file(
        &self,
        source: &Path,
        target: &Path,
        account_id: &str,
        passphrase: &str,
    ) -> Result<u64> {
        let input = BufReader::new(File::open(source)?);
        let output = BufWriter::new(File::create(target)?);
        self.encrypt(input, output, account_id, passphrase)
    }

    pub fn decrypt_file(
        &self,
        source: &Path,
        target: &Path,
        account_id: &str,
        passphrase: &str,
    ) -> Result<u64> {
        let input = BufReader::new(File::open(source)?);
        let output = BufWriter::new(File::create(target)?);
        self.decrypt(input, output, account_id, passphrase)
    }
}

/// True when the file at `path` starts with the envelope magic.
pub fn is_envelope(path: &Path) -> Result<bool> {
    let mut f = File::open(path)?;
    let mut magic = [0u8; 4];
    match f.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == ENVELOPE_MAGIC),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

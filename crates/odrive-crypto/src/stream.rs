//! Streaming AES-256-CTR with a running plaintext SHA-256.
//!
//! [`CipherReader`] wraps any `AsyncRead` and transforms bytes as they pass
//! through. Nothing is buffered beyond the caller's read buffer, so objects of
//! any size stream in constant memory.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::keys::ContentKey;
use crate::{CryptoError, CryptoResult, HASH_SIZE, IV_SIZE};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Which way bytes flow through the cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Input is plaintext; it is hashed before the keystream is applied.
    Encrypt,
    /// Input is ciphertext; the keystream is applied and the result hashed.
    Decrypt,
}

/// Result of a completed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// SHA-256 of the plaintext
    pub hash: [u8; HASH_SIZE],
    /// Bytes that passed through
    pub length: u64,
}

/// An `AsyncRead` adapter that encrypts or decrypts on the fly.
pub struct CipherReader<R> {
    inner: R,
    cipher: Aes256Ctr,
    hasher: Sha256,
    direction: Direction,
    length: u64,
}

impl<R> CipherReader<R> {
    pub fn new(inner: R, key: &ContentKey, iv: &[u8], direction: Direction) -> CryptoResult<Self> {
        if iv.len() != IV_SIZE {
            return Err(CryptoError::IvLength(iv.len()));
        }
        let cipher = Aes256Ctr::new(key.as_bytes().into(), iv.into());
        Ok(Self {
            inner,
            cipher,
            hasher: Sha256::new(),
            direction,
            length: 0,
        })
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Consume the reader and return the plaintext digest.
    pub fn finish(self) -> StreamSummary {
        StreamSummary {
            hash: self.hasher.finalize().into(),
            length: self.length,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CipherReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let chunk = &mut buf.filled_mut()[start..];
        match this.direction {
            Direction::Encrypt => {
                this.hasher.update(&*chunk);
                this.cipher.apply_keystream(chunk);
            }
            Direction::Decrypt => {
                this.cipher.apply_keystream(chunk);
                this.hasher.update(&*chunk);
            }
        }
        this.length += chunk.len() as u64;
        Poll::Ready(Ok(()))
    }
}

async fn pump<R, W>(
    reader: R,
    writer: &mut W,
    key: &ContentKey,
    iv: &[u8],
    direction: Direction,
) -> CryptoResult<StreamSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut cipher = CipherReader::new(reader, key, iv, direction)?;
    tokio::io::copy(&mut cipher, writer).await?;
    writer.flush().await?;
    Ok(cipher.finish())
}

/// Encrypt `plaintext` into `writer`, returning the plaintext hash and length.
pub async fn encrypt<R, W>(
    plaintext: R,
    writer: &mut W,
    key: &ContentKey,
    iv: &[u8],
) -> CryptoResult<StreamSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    pump(plaintext, writer, key, iv, Direction::Encrypt).await
}

/// Decrypt `ciphertext` into `writer`, returning the recovered plaintext hash.
pub async fn decrypt<R, W>(
    ciphertext: R,
    writer: &mut W,
    key: &ContentKey,
    iv: &[u8],
) -> CryptoResult<StreamSummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    pump(ciphertext, writer, key, iv, Direction::Decrypt).await
}

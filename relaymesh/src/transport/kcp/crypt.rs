// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Optional AEAD framing over a KCP byte stream
//!
//! Both peers first send a random 16-byte salt in the clear. HKDF-SHA256 over
//! the passphrase key and both salts yields one key per direction, after which
//! each frame is `[u16 BE ciphertext length][ciphertext || tag]` sealed with a
//! per-direction frame counter as its nonce.

use std::{
  io::{Error as IOError, ErrorKind},
  num::NonZeroU32,
  pin::Pin,
  task::{ready, Context, Poll},
};

use ring::{
  aead::{self, Aad, LessSafeKey, Nonce, UnboundKey},
  hkdf,
  rand::{SecureRandom, SystemRandom},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::transport::{session::SessionSide, TransportError};

const KEY_SALT: &[u8] = b"opww";
const KEY_ITERATIONS: NonZeroU32 = match NonZeroU32::new(4096) {
  Some(iterations) => iterations,
  None => panic!("iteration count must be non-zero"),
};
pub const DERIVED_KEY_LEN: usize = 32;
pub const SESSION_SALT_LEN: usize = 16;
const CLIENT_TO_SERVER: &[u8] = b"relaymesh kcp client to server";
const SERVER_TO_CLIENT: &[u8] = b"relaymesh kcp server to client";

const FRAME_HEADER_LEN: usize = std::mem::size_of::<u16>();
const MAX_PLAINTEXT_LEN: usize = 16 * 1024;
const READ_CHUNK_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
  Aes256Gcm,
  Aes128Gcm,
  ChaCha20Poly1305,
  None,
}

impl CipherKind {
  /// Unrecognised names fall back to AES-256-GCM
  pub fn from_name(name: &str) -> Self {
    match name.to_ascii_lowercase().as_str() {
      "aes" | "aes-256" | "" => Self::Aes256Gcm,
      "aes-128" => Self::Aes128Gcm,
      "chacha20" | "salsa20" => Self::ChaCha20Poly1305,
      "none" | "null" => Self::None,
      other => {
        tracing::warn!(cipher = other, "kcp_cipher_unknown_using_aes");
        Self::Aes256Gcm
      }
    }
  }

  /// `None` when encryption is disabled
  pub fn algorithm(self) -> Option<&'static aead::Algorithm> {
    match self {
      Self::Aes256Gcm => Some(&aead::AES_256_GCM),
      Self::Aes128Gcm => Some(&aead::AES_128_GCM),
      Self::ChaCha20Poly1305 => Some(&aead::CHACHA20_POLY1305),
      Self::None => None,
    }
  }
}

/// PBKDF2-HMAC-SHA1 over the passphrase with the fixed transport salt
pub fn derive_key(passphrase: &str) -> [u8; DERIVED_KEY_LEN] {
  let mut key = [0u8; DERIVED_KEY_LEN];
  ring::pbkdf2::derive(
    ring::pbkdf2::PBKDF2_HMAC_SHA1,
    KEY_ITERATIONS,
    KEY_SALT,
    passphrase.as_bytes(),
    &mut key,
  );
  key
}

fn crypto_error(context: &'static str) -> IOError {
  IOError::new(ErrorKind::InvalidData, context)
}

pub struct SealedStream<S> {
  inner: S,
  seal_key: LessSafeKey,
  open_key: LessSafeKey,
  seal_counter: u64,
  open_counter: u64,
  inbound: Vec<u8>,
  plaintext: Vec<u8>,
  plaintext_offset: usize,
  outbound: Vec<u8>,
  outbound_offset: usize,
}

/// Expands the session secret into the key for one direction
fn direction_key(
  secret: &hkdf::Prk,
  algorithm: &'static aead::Algorithm,
  label: &[u8],
) -> Result<LessSafeKey, TransportError> {
  let info = [label];
  let okm = secret
    .expand(&info, algorithm)
    .map_err(|_| TransportError::InvalidConfig("Unusable cipher key".into()))?;
  Ok(LessSafeKey::new(UnboundKey::from(okm)))
}

impl<S: AsyncRead + AsyncWrite + Unpin> SealedStream<S> {
  /// Exchanges fresh salts with the peer in the clear, then keys each direction
  /// from the passphrase key and both salts
  pub async fn establish(
    mut inner: S,
    algorithm: &'static aead::Algorithm,
    key: &[u8; DERIVED_KEY_LEN],
    side: SessionSide,
  ) -> Result<Self, TransportError> {
    let mut local_salt = [0u8; SESSION_SALT_LEN];
    SystemRandom::new()
      .fill(&mut local_salt)
      .map_err(|_| IOError::new(ErrorKind::Other, "System randomness unavailable"))?;
    inner.write_all(&local_salt).await?;
    inner.flush().await?;
    let mut peer_salt = [0u8; SESSION_SALT_LEN];
    inner.read_exact(&mut peer_salt).await?;

    let (client_salt, server_salt) = match side {
      SessionSide::Client => (local_salt, peer_salt),
      SessionSide::Server => (peer_salt, local_salt),
    };
    let mut session_salt = [0u8; 2 * SESSION_SALT_LEN];
    session_salt[..SESSION_SALT_LEN].copy_from_slice(&client_salt);
    session_salt[SESSION_SALT_LEN..].copy_from_slice(&server_salt);
    let secret = hkdf::Salt::new(hkdf::HKDF_SHA256, &session_salt).extract(key);
    let client_key = direction_key(&secret, algorithm, CLIENT_TO_SERVER)?;
    let server_key = direction_key(&secret, algorithm, SERVER_TO_CLIENT)?;
    let (seal_key, open_key) = match side {
      SessionSide::Client => (client_key, server_key),
      SessionSide::Server => (server_key, client_key),
    };
    Ok(Self {
      inner,
      seal_key,
      open_key,
      seal_counter: 0,
      open_counter: 0,
      inbound: Vec::new(),
      plaintext: Vec::new(),
      plaintext_offset: 0,
      outbound: Vec::new(),
      outbound_offset: 0,
    })
  }
}

impl<S> SealedStream<S> {
  fn nonce(counter: &mut u64) -> Result<Nonce, IOError> {
    let mut bytes = [0u8; aead::NONCE_LEN];
    bytes[aead::NONCE_LEN - 8..].copy_from_slice(&counter.to_be_bytes());
    *counter = counter
      .checked_add(1)
      .ok_or_else(|| crypto_error("Nonce space exhausted"))?;
    Ok(Nonce::assume_unique_for_key(bytes))
  }

  fn seal_frame(&mut self, plaintext: &[u8]) -> Result<(), IOError> {
    let nonce = Self::nonce(&mut self.seal_counter)?;
    let mut sealed = plaintext.to_vec();
    self
      .seal_key
      .seal_in_place_append_tag(nonce, Aad::empty(), &mut sealed)
      .map_err(|_| crypto_error("Frame encryption failed"))?;
    self.outbound.clear();
    self.outbound_offset = 0;
    self
      .outbound
      .extend_from_slice(&(sealed.len() as u16).to_be_bytes());
    self.outbound.extend_from_slice(&sealed);
    Ok(())
  }

  /// Decrypts the next complete frame from the inbound buffer, if one has arrived
  fn open_frame(&mut self) -> Result<bool, IOError> {
    if self.inbound.len() < FRAME_HEADER_LEN {
      return Ok(false);
    }
    let length = u16::from_be_bytes([self.inbound[0], self.inbound[1]]) as usize;
    if length < self.open_key.algorithm().tag_len() {
      return Err(crypto_error("Frame shorter than its authentication tag"));
    }
    if self.inbound.len() < FRAME_HEADER_LEN + length {
      return Ok(false);
    }
    let mut frame: Vec<u8> = self
      .inbound
      .drain(..FRAME_HEADER_LEN + length)
      .skip(FRAME_HEADER_LEN)
      .collect();
    let nonce = Self::nonce(&mut self.open_counter)?;
    let plaintext_len = self
      .open_key
      .open_in_place(nonce, Aad::empty(), &mut frame)
      .map_err(|_| crypto_error("Frame authentication failed"))?
      .len();
    frame.truncate(plaintext_len);
    self.plaintext = frame;
    self.plaintext_offset = 0;
    Ok(true)
  }
}

impl<S: AsyncWrite + Unpin> SealedStream<S> {
  fn poll_drain_outbound(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    while self.outbound_offset < self.outbound.len() {
      let written =
        ready!(Pin::new(&mut self.inner).poll_write(cx, &self.outbound[self.outbound_offset..]))?;
      if written == 0 {
        return Poll::Ready(Err(IOError::from(ErrorKind::WriteZero)));
      }
      self.outbound_offset += written;
    }
    self.outbound.clear();
    self.outbound_offset = 0;
    Poll::Ready(Ok(()))
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for SealedStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = Pin::into_inner(self);
    loop {
      if this.plaintext_offset < this.plaintext.len() {
        let available = &this.plaintext[this.plaintext_offset..];
        let count = available.len().min(buf.remaining());
        buf.put_slice(&available[..count]);
        this.plaintext_offset += count;
        return Poll::Ready(Ok(()));
      }
      if this.open_frame()? {
        continue;
      }
      let mut chunk = [0u8; READ_CHUNK_LEN];
      let mut chunk_buf = ReadBuf::new(&mut chunk);
      ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
      let filled = chunk_buf.filled();
      if filled.is_empty() {
        return if this.inbound.is_empty() {
          Poll::Ready(Ok(()))
        } else {
          Poll::Ready(Err(IOError::from(ErrorKind::UnexpectedEof)))
        };
      }
      this.inbound.extend_from_slice(filled);
    }
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SealedStream<S> {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = Pin::into_inner(self);
    ready!(this.poll_drain_outbound(cx))?;
    if buf.is_empty() {
      return Poll::Ready(Ok(0));
    }
    let accepted = buf.len().min(MAX_PLAINTEXT_LEN);
    this.seal_frame(&buf[..accepted])?;
    // The sealed frame is owned by the stream now; a pending drain resumes on the next write or flush
    if let Poll::Ready(Err(error)) = this.poll_drain_outbound(cx) {
      return Poll::Ready(Err(error));
    }
    Poll::Ready(Ok(accepted))
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    let this = Pin::into_inner(self);
    ready!(this.poll_drain_outbound(cx))?;
    Pin::new(&mut this.inner).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    let this = Pin::into_inner(self);
    ready!(this.poll_drain_outbound(cx))?;
    Pin::new(&mut this.inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

  use super::{derive_key, CipherKind, SealedStream, SESSION_SALT_LEN};
  use crate::transport::session::SessionSide;

  async fn sealed_pair(
    cipher: CipherKind,
    client_key: &str,
    server_key: &str,
  ) -> (SealedStream<DuplexStream>, SealedStream<DuplexStream>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let algorithm = cipher.algorithm().unwrap();
    let (client_key, server_key) = (derive_key(client_key), derive_key(server_key));
    let (client, server) = tokio::join!(
      SealedStream::establish(a, algorithm, &client_key, SessionSide::Client),
      SealedStream::establish(b, algorithm, &server_key, SessionSide::Server),
    );
    (client.unwrap(), server.unwrap())
  }

  /// Seals `plaintext` from a client whose peer answers with a fixed salt, and
  /// returns the frame as it appears on the wire
  async fn sealed_frame(passphrase: &str, plaintext: &[u8]) -> Vec<u8> {
    let (a, mut raw) = tokio::io::duplex(1024);
    let key = derive_key(passphrase);
    let peer = async {
      let mut client_salt = [0u8; SESSION_SALT_LEN];
      raw.read_exact(&mut client_salt).await.unwrap();
      raw.write_all(&[7u8; SESSION_SALT_LEN]).await.unwrap();
    };
    let (sealed, ()) = tokio::join!(
      SealedStream::establish(a, &ring::aead::AES_256_GCM, &key, SessionSide::Client),
      peer,
    );
    let mut sealed = sealed.unwrap();
    sealed.write_all(plaintext).await.unwrap();
    sealed.flush().await.unwrap();
    let mut frame = vec![0u8; 2 + plaintext.len() + 16];
    raw.read_exact(&mut frame).await.unwrap();
    frame
  }

  #[test]
  fn cipher_names() {
    assert_eq!(CipherKind::from_name("aes"), CipherKind::Aes256Gcm);
    assert_eq!(CipherKind::from_name("aes-128"), CipherKind::Aes128Gcm);
    assert_eq!(CipherKind::from_name("salsa20"), CipherKind::ChaCha20Poly1305);
    assert_eq!(CipherKind::from_name("null"), CipherKind::None);
    assert_eq!(CipherKind::from_name("blowfish"), CipherKind::Aes256Gcm);
  }

  #[test]
  fn key_derivation_is_deterministic() {
    assert_eq!(derive_key("pass"), derive_key("pass"));
    assert_ne!(derive_key("pass"), derive_key("other"));
  }

  #[test]
  fn disabled_cipher_has_no_algorithm() {
    assert!(CipherKind::None.algorithm().is_none());
    assert!(CipherKind::Aes256Gcm.algorithm().is_some());
  }

  #[tokio::test]
  async fn sealed_streams_exchange_large_payloads() {
    for cipher in [
      CipherKind::Aes256Gcm,
      CipherKind::Aes128Gcm,
      CipherKind::ChaCha20Poly1305,
    ] {
      let (mut client, mut server) = sealed_pair(cipher, "passphrase", "passphrase").await;
      let payload: Vec<u8> = (0..100_000u32).map(|x| (x % 253) as u8).collect();
      let expected = payload.clone();
      let writer = tokio::spawn(async move {
        client.write_all(&payload).await.unwrap();
        client.flush().await.unwrap();
        client
      });
      let mut received = vec![0u8; expected.len()];
      server.read_exact(&mut received).await.unwrap();
      assert_eq!(received, expected);
      let mut client = writer.await.unwrap();
      server.write_all(b"reply").await.unwrap();
      server.flush().await.unwrap();
      let mut reply = [0u8; 5];
      client.read_exact(&mut reply).await.unwrap();
      assert_eq!(&reply, b"reply");
    }
  }

  #[tokio::test]
  async fn ciphertext_differs_from_plaintext() {
    let frame = sealed_frame("passphrase", b"test buffer").await;
    assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), 11 + 16);
    assert_ne!(&frame[2..13], b"test buffer");
  }

  #[tokio::test]
  async fn sessions_sharing_a_passphrase_never_share_keystreams() {
    let first_plaintext = b"attack at dawn!!";
    let second_plaintext = b"retreat at dusk!";
    let first = sealed_frame("shared passphrase", first_plaintext).await;
    let second = sealed_frame("shared passphrase", second_plaintext).await;
    let ciphertext_xor: Vec<u8> = first[2..18]
      .iter()
      .zip(&second[2..18])
      .map(|(a, b)| a ^ b)
      .collect();
    let plaintext_xor: Vec<u8> = first_plaintext
      .iter()
      .zip(second_plaintext)
      .map(|(a, b)| a ^ b)
      .collect();
    assert_ne!(ciphertext_xor, plaintext_xor);
    // Identical plaintext under the same passphrase still differs per session
    let repeated = sealed_frame("shared passphrase", first_plaintext).await;
    assert_ne!(first, repeated);
  }

  #[tokio::test]
  async fn mismatched_keys_fail_authentication() {
    let (mut client, mut server) = sealed_pair(CipherKind::Aes256Gcm, "one", "two").await;
    client.write_all(b"hello").await.unwrap();
    client.flush().await.unwrap();
    let mut buf = [0u8; 5];
    let error = server.read_exact(&mut buf).await.unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
  }
}

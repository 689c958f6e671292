// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Access-token handshake run once per connection on the raw transport
//!
//! The dialer sends its token as a 2-byte-length-prefixed frame and expects
//! the identical frame echoed back; the listener validates the token and
//! echoes it on acceptance.

use std::{future::Future, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};

use super::{AuthError, AuthValidator};
use crate::util::framed::{read_short_frame, write_short_frame, WriteError, MAX_SHORT_FRAME_LENGTH};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn map_write_error(error: WriteError) -> AuthError {
  match error {
    WriteError::MaxLengthExceeded { length } => AuthError::TokenTooLong { length },
    WriteError::UnexpectedEnd(io) => AuthError::Write(io),
  }
}

/// Presents `token` and waits for the listener to echo it back
///
/// A `None` token skips the exchange entirely.
#[tracing::instrument(level = "debug", skip_all, err)]
pub async fn request_auth<T>(io: &mut T, token: Option<&str>) -> Result<(), AuthError>
where
  T: AsyncRead + AsyncWrite + Unpin,
{
  let token = match token {
    Some(token) => token,
    None => return Ok(()),
  };
  if token.len() > MAX_SHORT_FRAME_LENGTH {
    return Err(AuthError::TokenTooLong {
      length: token.len(),
    });
  }
  write_short_frame(&mut *io, token.as_bytes())
    .await
    .map_err(map_write_error)?;
  let reply = read_short_frame(&mut *io).await?;
  if reply != token.as_bytes() {
    return Err(AuthError::ReplyMismatch);
  }
  Ok(())
}

/// Reads the peer's token and checks it against `validator`, echoing it on success
///
/// Returns the accepted token, or `None` when no validator is installed and the
/// exchange was skipped.
#[tracing::instrument(level = "debug", skip_all, err)]
pub async fn verify_auth<T>(
  io: &mut T,
  validator: Option<&AuthValidator>,
) -> Result<Option<String>, AuthError>
where
  T: AsyncRead + AsyncWrite + Unpin,
{
  let validator = match validator {
    Some(validator) => validator,
    None => return Ok(None),
  };
  let frame = read_short_frame(&mut *io).await?;
  // Non-UTF-8 content can never match a configured token
  let token = String::from_utf8(frame).map_err(|_| AuthError::Rejected)?;
  if !validator(&token) {
    return Err(AuthError::Rejected);
  }
  write_short_frame(&mut *io, token.as_bytes())
    .await
    .map_err(map_write_error)?;
  Ok(Some(token))
}

/// Bounds a handshake future by [`HANDSHAKE_TIMEOUT`]
pub async fn with_handshake_deadline<F, T>(handshake: F) -> Result<T, AuthError>
where
  F: Future<Output = Result<T, AuthError>>,
{
  tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
    .await
    .map_err(|_elapsed| AuthError::TimedOut(HANDSHAKE_TIMEOUT))?
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::{request_auth, verify_auth, with_handshake_deadline};
  use crate::transport::{allow_list_validator, AuthError};

  #[tokio::test]
  async fn accepted_token_is_echoed() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let validator = allow_list_validator(["test auth"]);
    let (client_result, server_result) = futures::future::join(
      request_auth(&mut client, Some("test auth")),
      verify_auth(&mut server, Some(&validator)),
    )
    .await;
    client_result.expect("Dialer side must accept the echo");
    assert_eq!(server_result.unwrap().as_deref(), Some("test auth"));
  }

  #[tokio::test]
  async fn rejected_token_fails_both_sides() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let validator = allow_list_validator(["test auth"]);
    let server_task = tokio::spawn(async move {
      let result = verify_auth(&mut server, Some(&validator)).await;
      // Dropping the raw stream stands in for closing the rejected connection
      drop(server);
      result
    });
    let client_result = request_auth(&mut client, Some("invalid test auth")).await;
    assert!(matches!(client_result, Err(AuthError::UnexpectedEnd(_))));
    assert!(matches!(server_task.await.unwrap(), Err(AuthError::Rejected)));
  }

  #[tokio::test]
  async fn mismatched_echo_is_rejected_by_dialer() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let server_task = tokio::spawn(async move {
      let mut header = [0u8; 2];
      server.read_exact(&mut header).await.unwrap();
      let mut token = vec![0u8; u16::from_be_bytes(header) as usize];
      server.read_exact(&mut token).await.unwrap();
      server.write_all(&[0, 3, b'b', b'a', b'd']).await.unwrap();
      server
    });
    let result = request_auth(&mut client, Some("good")).await;
    assert!(matches!(result, Err(AuthError::ReplyMismatch)));
    let _server = server_task.await.unwrap();
  }

  #[tokio::test]
  async fn absent_token_and_validator_skip_exchange() {
    let (mut client, mut server) = tokio::io::duplex(16);
    request_auth(&mut client, None).await.unwrap();
    assert_eq!(verify_auth(&mut server, None).await.unwrap(), None);
    // Nothing was written in either direction
    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"x");
  }

  #[tokio::test]
  async fn oversized_token_is_refused_before_writing() {
    let (mut client, _server) = tokio::io::duplex(16);
    let token = "a".repeat(u16::MAX as usize + 1);
    let result = request_auth(&mut client, Some(&token)).await;
    assert!(matches!(result, Err(AuthError::TokenTooLong { .. })));
  }

  #[tokio::test(start_paused = true)]
  async fn silent_peer_times_out() {
    let (mut client, _server) = tokio::io::duplex(1024);
    let result = with_handshake_deadline(request_auth(&mut client, Some("test auth"))).await;
    assert!(matches!(result, Err(AuthError::TimedOut(_))));
  }

  #[tokio::test]
  async fn validator_sees_raw_token() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_by_validator = seen.clone();
    let validator: crate::transport::AuthValidator = Arc::new(move |token: &str| {
      seen_by_validator.lock().unwrap().push(token.to_string());
      true
    });
    let (mut client, mut server) = tokio::io::duplex(1024);
    let (c, s) = futures::future::join(
      request_auth(&mut client, Some("token with spaces")),
      verify_auth(&mut server, Some(&validator)),
    )
    .await;
    c.unwrap();
    s.unwrap();
    assert_eq!(&*seen.lock().unwrap(), &["token with spaces".to_string()]);
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Short frames carrying a 2-byte big-endian length prefix, as used by the
//! connection handshake.

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    error: ::std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame length of {length} bytes does not fit a 2-byte length prefix")]
  MaxLengthExceeded { length: usize },
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
}

pub const MAX_SHORT_FRAME_LENGTH: usize = u16::MAX as usize;

pub async fn read_short_frame<T: tokio::io::AsyncRead + Unpin>(
  mut s: T,
) -> Result<Vec<u8>, ReadError> {
  use tokio::io::AsyncReadExt;
  let length = s
    .read_u16()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

/// Writes the length prefix and content as a single buffer so that
/// datagram-backed transports carry the frame in one segment
pub async fn write_short_frame<T: tokio::io::AsyncWrite + Unpin>(
  mut s: T,
  buffer: &[u8],
) -> Result<(), WriteError> {
  use tokio::io::AsyncWriteExt;
  if buffer.len() > MAX_SHORT_FRAME_LENGTH {
    return Err(WriteError::MaxLengthExceeded {
      length: buffer.len(),
    });
  }
  let mut framed = Vec::with_capacity(buffer.len() + std::mem::size_of::<u16>());
  framed.extend_from_slice(&(buffer.len() as u16).to_be_bytes());
  framed.extend_from_slice(buffer);
  s.write_all(&framed).await?;
  Ok(s.flush().await?)
}

#[cfg(test)]
mod tests {
  use super::{read_short_frame, write_short_frame, NextExpected, ReadError, WriteError};

  #[tokio::test]
  async fn stream_framed_roundtrip() {
    const TEST_BLOB_LENGTH: usize = 1234;
    let mut buffer: Vec<u8> = Vec::new();
    let test_data: Vec<u8> = (0..TEST_BLOB_LENGTH).map(|x| (x % 251) as u8).collect();
    write_short_frame(&mut buffer, &test_data)
      .await
      .expect("Writing frame to buffer must succeed");
    // Length prefix is big-endian
    assert_eq!(&buffer[..2], &(TEST_BLOB_LENGTH as u16).to_be_bytes());
    assert_eq!(&buffer[2..], &test_data[..]);
    let mut cursor = std::io::Cursor::new(buffer);
    let deserialized = read_short_frame(&mut cursor)
      .await
      .expect("Reading frame from buffer must succeed");
    assert_eq!(test_data, deserialized);
  }

  #[tokio::test]
  async fn oversized_frame_is_not_written() {
    let mut buffer: Vec<u8> = Vec::new();
    let oversized = vec![0u8; super::MAX_SHORT_FRAME_LENGTH + 1];
    let result = write_short_frame(&mut buffer, &oversized).await;
    assert!(matches!(result, Err(WriteError::MaxLengthExceeded { .. })));
    assert!(
      buffer.is_empty(),
      "Buffer must not have been written to during a max length error"
    );
  }

  #[tokio::test]
  async fn truncated_content_reports_expectation() {
    let mut cursor = std::io::Cursor::new(vec![0u8, 5, b'a', b'b']);
    match read_short_frame(&mut cursor).await {
      Err(ReadError::UnexpectedEnd { expected, .. }) => {
        assert_eq!(expected, NextExpected::Content { length: 5 })
      }
      other => panic!("Expected truncation failure, got {:?}", other),
    }
  }
}

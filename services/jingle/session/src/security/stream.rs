//! Record framing for encrypted byte streams.
//!
//! Each record is a big-endian `u32` length followed by the AEAD output for
//! at most [`MAX_RECORD`] plaintext bytes. Every direction keeps its own
//! record counter, which is mixed into the nonce together with the sender's
//! direction byte.

use crate::security::cipher::{SymmetricKey, TAG_LEN};
use bytes::{Buf, BufMut, BytesMut};
use futures::ready;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest plaintext carried by one record
pub const MAX_RECORD: usize = 16 * 1024;

const LEN_PREFIX: usize = 4;
const READ_CHUNK: usize = 8 * 1024;

/// Boxed read half of a byte stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a byte stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

fn crypto_error(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Encrypts everything written to it
pub struct EncryptingWriter<W> {
    inner: W,
    key: Arc<SymmetricKey>,
    direction: u8,
    counter: u64,
    pending: BytesMut,
}

impl<W: AsyncWrite + Unpin> EncryptingWriter<W> {
    /// Wrap `inner`, sealing records with the sender's `direction`
    pub fn new(inner: W, key: Arc<SymmetricKey>, direction: u8) -> Self {
        Self {
            inner,
            key,
            direction,
            counter: 0,
            pending: BytesMut::new(),
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if written == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(written);
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for EncryptingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let take = buf.len().min(MAX_RECORD);
        let sealed = this
            .key
            .seal(this.direction, this.counter, &buf[..take])
            .map_err(crypto_error)?;
        this.counter += 1;
        this.pending.reserve(LEN_PREFIX + sealed.len());
        this.pending.put_u32(sealed.len() as u32);
        this.pending.extend_from_slice(&sealed);

        // The record is accepted; push it out as far as the socket allows
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Decrypts everything read from it
pub struct DecryptingReader<R> {
    inner: R,
    key: Arc<SymmetricKey>,
    direction: u8,
    counter: u64,
    raw: BytesMut,
    plain: BytesMut,
}

impl<R: AsyncRead + Unpin> DecryptingReader<R> {
    /// Wrap `inner`, opening records sealed with the peer's `direction`
    pub fn new(inner: R, key: Arc<SymmetricKey>, direction: u8) -> Self {
        Self {
            inner,
            key,
            direction,
            counter: 0,
            raw: BytesMut::new(),
            plain: BytesMut::new(),
        }
    }

    fn next_record(&mut self) -> io::Result<Option<BytesMut>> {
        if self.raw.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.raw[..LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len < TAG_LEN || len > MAX_RECORD + TAG_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid record length {}", len),
            ));
        }
        if self.raw.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        self.raw.advance(LEN_PREFIX);
        Ok(Some(self.raw.split_to(len)))
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain.is_empty() {
                let take = buf.remaining().min(this.plain.len());
                buf.put_slice(&this.plain[..take]);
                this.plain.advance(take);
                return Poll::Ready(Ok(()));
            }

            if let Some(record) = this.next_record()? {
                let opened = this
                    .key
                    .open(this.direction, this.counter, &record)
                    .map_err(crypto_error)?;
                this.counter += 1;
                this.plain.extend_from_slice(&opened);
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                if this.raw.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a record",
                )));
            }
            this.raw.extend_from_slice(chunk_buf.filled());
        }
    }
}

/// Byte stream with both directions encrypted
pub struct SecureStream {
    reader: DecryptingReader<BoxedReader>,
    writer: EncryptingWriter<BoxedWriter>,
}

impl SecureStream {
    /// Join an encrypting write half and a decrypting read half
    pub fn new(
        reader: DecryptingReader<BoxedReader>,
        writer: EncryptingWriter<BoxedWriter>,
    ) -> Self {
        Self { reader, writer }
    }
}

impl AsyncRead for SecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::cipher::Cipher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_large_write_spans_records() {
        let key = Arc::new(SymmetricKey::generate(Cipher::Aes256Gcm));
        let (a, b) = tokio::io::duplex(4096);
        let mut writer = EncryptingWriter::new(a, Arc::clone(&key), 0);
        let mut reader = DecryptingReader::new(b, key, 0);

        let payload: Vec<u8> = (0..(MAX_RECORD * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let write = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        write.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_tampered_record_is_rejected() {
        let key = Arc::new(SymmetricKey::generate(Cipher::ChaCha20Poly1305));
        let mut sink = Vec::new();
        {
            let mut writer = EncryptingWriter::new(&mut sink, Arc::clone(&key), 1);
            writer.write_all(b"secret").await.unwrap();
            writer.flush().await.unwrap();
        }
        let last = sink.len() - 1;
        sink[last] ^= 0x01;

        let mut reader = DecryptingReader::new(sink.as_slice(), key, 1);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_direction_mismatch_is_rejected() {
        let key = Arc::new(SymmetricKey::generate(Cipher::Aes256Gcm));
        let mut sink = Vec::new();
        {
            let mut writer = EncryptingWriter::new(&mut sink, Arc::clone(&key), 0);
            writer.write_all(b"hello").await.unwrap();
            writer.flush().await.unwrap();
        }
        let mut reader = DecryptingReader::new(sink.as_slice(), key, 1);
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }
}

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Single-byte frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Read one newline-terminated frame, without its delimiter.
///
/// Returns `Ok(None)` on EOF; bytes after the last delimiter are an incomplete
/// frame and are dropped. A frame longer than `max_len` is an `InvalidData`
/// error.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Option<Bytes>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = BytesMut::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(None);
        }

        let (chunk, done) = match available.iter().position(|b| *b == DELIMITER) {
            Some(pos) => (&available[..pos], Some(pos + 1)),
            None => (available, None),
        };

        if frame.len() + chunk.len() > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {max_len} bytes"),
            ));
        }
        frame.extend_from_slice(chunk);

        match done {
            Some(consumed) => {
                reader.consume(consumed);
                return Ok(Some(frame.freeze()));
            }
            None => {
                let consumed = chunk.len();
                reader.consume(consumed);
            }
        }
    }
}

/// Write `frame` followed by the delimiter and flush so peers see it promptly.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.write_all(&[DELIMITER]).await?;
    writer.flush().await
}

/// True if `payload` can travel as a single frame.
pub fn is_single_line(payload: &[u8]) -> bool {
    !payload.contains(&DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut reader = BufReader::new(reader);

        write_frame(&mut writer, b"first").await.expect("write");
        write_frame(&mut writer, b"").await.expect("write empty");
        write_frame(&mut writer, b"third frame").await.expect("write");
        drop(writer);

        assert_eq!(
            read_frame(&mut reader, 1024).await.unwrap(),
            Some(Bytes::from_static(b"first"))
        );
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), Some(Bytes::new()));
        assert_eq!(
            read_frame(&mut reader, 1024).await.unwrap(),
            Some(Bytes::from_static(b"third frame"))
        );
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn frame_split_across_small_buffer_is_reassembled() {
        let data: &[u8] = b"a fairly long line that spans many buffer fills\nnext\n";
        let mut reader = BufReader::with_capacity(4, data);

        let first = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(&first[..], b"a fairly long line that spans many buffer fills");
        let second = read_frame(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(&second[..], b"next");
    }

    #[tokio::test]
    async fn trailing_partial_frame_is_dropped() {
        let data: &[u8] = b"complete\npartial";
        let mut reader = BufReader::new(data);

        assert!(read_frame(&mut reader, 1024).await.unwrap().is_some());
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let data: &[u8] = b"0123456789abcdef\n";
        let mut reader = BufReader::new(data);

        let err = read_frame(&mut reader, 8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn delimiter_check() {
        assert!(is_single_line(b"hello"));
        assert!(!is_single_line(b"two\nlines"));
    }
}

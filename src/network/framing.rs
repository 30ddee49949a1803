//! Wire framing: `[u32 little-endian length][payload]` per message.

use crate::error::{ChainError, Result};
use futures::{SinkExt, StreamExt};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::PeerIo;

pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub type FramedStream = Framed<Box<dyn PeerIo>, LengthDelimitedCodec>;

pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .little_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn framed<S: PeerIo + 'static>(io: S) -> FramedStream {
    Framed::new(Box::new(io), frame_codec())
}

pub async fn write_message(stream: &mut FramedStream, payload: &[u8]) -> Result<()> {
    stream
        .send(Bytes::copy_from_slice(payload))
        .await
        .map_err(|e| ChainError::NetworkError(format!("Failed to write frame: {}", e)))
}

/// Reads the next frame; a stream closed before a full frame is an error.
pub async fn read_message(stream: &mut FramedStream) -> Result<Vec<u8>> {
    match stream.next().await {
        Some(Ok(frame)) => Ok(frame.to_vec()),
        Some(Err(e)) => Err(ChainError::NetworkError(format!("Failed to read frame: {}", e))),
        None => Err(ChainError::NetworkError("Stream closed before a frame arrived".to_string())),
    }
}

/// Writes one message and closes the stream.
pub async fn send_and_close(mut stream: FramedStream, payload: &[u8]) -> Result<()> {
    write_message(&mut stream, payload).await?;
    SinkExt::<Bytes>::close(&mut stream)
        .await
        .map_err(|e| ChainError::NetworkError(format!("Failed to close stream: {}", e)))
}

use tracing::{debug, trace};

use crate::{EngineConnection, EngineError};

/// What the server echoes once a stream's FIN arrives
pub const STREAM_FINISHED: &[u8] = b"Stream finished.\n";

/// Consumer of the stream data an established connection receives
///
/// Called once per chunk read from a readable stream, with the connection the chunk belongs to so
/// the application can answer on it. Anything it queues is sent by the flush that follows.
pub trait Application {
    /// Handle `data` read from `stream_id`; `fin` marks the final chunk of the stream
    fn on_stream_data<C: EngineConnection>(
        &mut self,
        conn: &mut C,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<(), EngineError>;
}

/// Echoes every stream back to the peer
///
/// When the peer finishes a stream, the echo is terminated with [`STREAM_FINISHED`] and a FIN of
/// its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Application for Echo {
    fn on_stream_data<C: EngineConnection>(
        &mut self,
        conn: &mut C,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<(), EngineError> {
        if !data.is_empty() {
            let written = conn.stream_send(stream_id, data, false)?;
            if written < data.len() {
                debug!(
                    stream_id,
                    dropped = data.len() - written,
                    "stream blocked, echo truncated"
                );
            }
        }
        if fin {
            trace!(stream_id, "peer finished stream");
            conn.stream_send(stream_id, STREAM_FINISHED, true)?;
        }
        Ok(())
    }
}

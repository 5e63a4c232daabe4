//! Echo handler: every context writes back exactly what it reads.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::server::{BoxReader, BoxWriter, ContextHandler, ContextId};

const ECHO_BUFFER: usize = 32;

pub struct Echo;

#[async_trait::async_trait]
impl ContextHandler for Echo {
    async fn run(
        &self,
        context: ContextId,
        mut reader: BoxReader,
        mut writer: BoxWriter,
    ) -> io::Result<()> {
        let mut buf = [0u8; ECHO_BUFFER];
        let mut total = 0usize;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tracing::trace!(%context, bytes = n, "Echoing");
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;
            total += n;
        }
        tracing::debug!(%context, total, "Peer closed");
        Ok(())
    }
}

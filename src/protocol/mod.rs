//! Wire format: command frames, addresses and UDP fragmentation.

mod address;
mod command;
mod error;
mod fragment;

pub use address::Address;
pub use command::{
    Authenticate, Command, CommandHeader, CommandType, Connect, Dissociate, Packet,
};
pub use error::CodecError;
pub use fragment::{Reassembler, fragment};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Fill `buf` from `reader`, reporting a short stream as `Incomplete`.
async fn read_exact_counted<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), CodecError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(CodecError::incomplete(buf.len(), filled));
        }
        filled += n;
    }
    Ok(())
}

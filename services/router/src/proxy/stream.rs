//! Bidirectional byte copying between two connections.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

const COPY_BUFFER: usize = 8192;

/// Proxy data bidirectionally between two streams.
///
/// EOF on one side half-closes the other in the same direction. Both
/// directions are awaited before returning.
///
/// Returns (bytes_to_b, bytes_from_b).
pub async fn proxy_bidirectional<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let (a_result, b_result) = tokio::join!(
        copy_half(&mut a_read, &mut b_write),
        copy_half(&mut b_read, &mut a_write),
    );

    // Return bytes transferred even if one direction errored
    let bytes_to_b = a_result.unwrap_or(0);
    let bytes_from_b = b_result.unwrap_or(0);

    Ok((bytes_to_b, bytes_from_b))
}

async fn copy_half<R, W>(reader: &mut ReadHalf<R>, writer: &mut WriteHalf<W>) -> io::Result<u64>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                writer.write_all(&buf[..n]).await?;
                total += n as u64;
            }
            Err(e) => {
                // Let the peer see the failure as EOF.
                let _ = writer.shutdown().await;
                return Err(e);
            }
        }
    }
    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_half_close_propagates() {
        // client <-> (proxy_a | proxy_b) <-> backend
        let (mut client, proxy_a) = pair().await;
        let (proxy_b, mut backend) = pair().await;
        let proxy = tokio::spawn(proxy_bidirectional(proxy_a, proxy_b));

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        backend.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping");

        // The reverse direction stays open after the client's half-close.
        backend.write_all(b"pong").await.unwrap();
        backend.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"pong");

        let (to_b, from_b) = proxy.await.unwrap().unwrap();
        assert_eq!((to_b, from_b), (4, 4));
    }
}

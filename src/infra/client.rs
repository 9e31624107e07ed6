//! One-shot client used by `markdownd send`.

use std::{io, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::timeout,
};
use tracing::debug;

use crate::config::ListenAddress;

use super::{error::InfraError, transport::connect};

/// Send a framed payload, half-close, and collect the whole response.
pub async fn request(
    address: &ListenAddress,
    payload: &[u8],
    limit: Duration,
) -> Result<Vec<u8>, InfraError> {
    let exchange = async {
        let mut stream = connect(address)
            .await
            .map_err(|err| InfraError::configuration(format!("cannot reach {address}: {err}")))?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok::<_, InfraError>(response)
    };

    let response = timeout(limit, exchange).await.map_err(|_| {
        InfraError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no response from {address} within {limit:?}"),
        ))
    })??;

    debug!(
        target = "markdownd::client",
        address = %address,
        sent = payload.len(),
        received = response.len(),
        "request complete"
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    use super::*;

    #[tokio::test]
    async fn request_half_closes_and_reads_reply() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("echo.sock");
        let listener = UnixListener::bind(&path).expect("bind");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.expect("read");
            stream.write_all(&received.to_ascii_uppercase()).await.expect("write");
        });

        let reply = request(
            &ListenAddress::Unix(path),
            b"hello",
            Duration::from_secs(5),
        )
        .await
        .expect("reply");

        assert_eq!(reply, b"HELLO");
        server.await.expect("server");
    }

    #[tokio::test]
    async fn unreachable_daemon_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        let err = request(
            &ListenAddress::Unix(dir.path().join("missing.sock")),
            b"x",
            Duration::from_secs(1),
        )
        .await
        .expect_err("no daemon");

        assert!(err.to_string().contains("cannot reach"));
    }
}

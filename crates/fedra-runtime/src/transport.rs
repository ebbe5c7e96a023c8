//! TCP transport for the executor service.
//!
//! Length-delimited frames carrying JSON-encoded tarpc messages.

use std::net::SocketAddr;

use tarpc::server::{BaseChannel, Channel};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

use crate::error::{ExecutorError, Result};
use crate::service::{ExecutorServer, ExecutorService, ExecutorServiceClient};

/// Create a tarpc serde transport over a TCP stream.
pub fn tarpc_transport<Item, SinkItem>(
    stream: TcpStream,
) -> tarpc::serde_transport::Transport<
    TcpStream,
    Item,
    SinkItem,
    tokio_serde::formats::Json<Item, SinkItem>,
>
where
    Item: for<'de> serde::Deserialize<'de>,
    SinkItem: serde::Serialize,
{
    tarpc::serde_transport::new(
        tokio_util::codec::length_delimited::Builder::new().new_framed(stream),
        tokio_serde::formats::Json::default(),
    )
}

/// Connect to an executor service.
pub async fn connect(addr: impl ToSocketAddrs) -> Result<ExecutorServiceClient> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ExecutorError::RemoteUnavailable(e.to_string()))?;
    let peer = stream.peer_addr().ok();
    let client =
        ExecutorServiceClient::new(tarpc::client::Config::default(), tarpc_transport(stream))
            .spawn();
    info!(?peer, "connected to executor service");
    Ok(client)
}

/// Serve one accepted connection until the peer goes away.
pub fn serve_connection(server: &ExecutorServer, stream: TcpStream) {
    let channel = BaseChannel::with_defaults(tarpc_transport(stream));
    let handler = server.clone();
    tokio::spawn(async move {
        use futures_util::StreamExt;
        channel
            .execute(handler.serve())
            .for_each(|response| async move {
                tokio::spawn(response);
            })
            .await;
    });
}

/// Bind `addr` and serve every incoming connection.
pub async fn serve_tcp(server: ExecutorServer, addr: impl ToSocketAddrs) -> Result<()> {
    let listener = bind(addr).await?;
    accept_loop(server, listener).await
}

pub async fn bind(addr: impl ToSocketAddrs) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ExecutorError::Service(format!("cannot bind: {e}")))?;
    let local: Option<SocketAddr> = listener.local_addr().ok();
    info!(?local, "executor service listening");
    Ok(listener)
}

/// Accept connections on `listener` forever.
pub async fn accept_loop(server: ExecutorServer, listener: TcpListener) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "accepted connection");
                serve_connection(&server, stream);
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::factory::ExecutorFactory;
    use tarpc::context;

    #[tokio::test]
    async fn ping_over_tcp() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = ExecutorServer::new(ExecutorFactory::from_config(RuntimeConfig::default()));
        tokio::spawn(accept_loop(server, listener));

        let client = connect(addr).await.unwrap();
        assert_eq!(client.ping(context::current(), 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn connect_to_nothing_is_unavailable() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(
            connect(addr).await,
            Err(ExecutorError::RemoteUnavailable(_))
        ));
    }
}

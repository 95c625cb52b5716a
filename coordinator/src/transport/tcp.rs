//! TCP transport: one connection per request, postcard frames

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use futures::{SinkExt, StreamExt};
use switchboard_paxos::TransportError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::{Handler, NodeTransport};
use crate::cluster::{Node, NodeId};
use crate::codec::PostcardCodec;
use crate::wire::{NodeEnvelope, NodeResponse};

/// Send one request over `stream` and wait for its response.
///
/// # Errors
///
/// [`TransportError`] if the stream fails or closes before the response.
pub async fn exchange<S>(stream: S, envelope: NodeEnvelope) -> Result<NodeResponse, Report<TransportError>>
where
    S: AsyncRead + AsyncWrite,
{
    let (read, write) = tokio::io::split(stream);
    let mut requests = FramedWrite::new(write, PostcardCodec::<NodeEnvelope>::new());
    let mut responses = FramedRead::new(read, PostcardCodec::<NodeResponse>::new());

    requests
        .send(envelope)
        .await
        .change_context(TransportError)
        .attach_printable("sending request")?;
    match responses.next().await {
        Some(response) => response
            .change_context(TransportError)
            .attach_printable("reading response"),
        None => Err(Report::new(TransportError).attach_printable("connection closed before response")),
    }
}

/// Answer every request arriving on `stream` until the peer closes it.
///
/// # Errors
///
/// The underlying I/O or decoding error.
pub async fn serve_connection<S, H>(stream: S, handler: &H) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite,
    H: Handler + ?Sized,
{
    let (read, write) = tokio::io::split(stream);
    let mut requests = FramedRead::new(read, PostcardCodec::<NodeEnvelope>::new());
    let mut responses = FramedWrite::new(write, PostcardCodec::<NodeResponse>::new());

    while let Some(envelope) = requests.next().await {
        let envelope = envelope?;
        trace!(from = %envelope.from, "request received");
        responses.send(handler.handle(envelope)).await?;
    }
    Ok(())
}

/// Accept connections on `listener` until `token` is cancelled.
///
/// # Errors
///
/// Failure to accept a connection.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve<H: Handler>(
    listener: TcpListener,
    handler: Arc<H>,
    token: CancellationToken,
) -> io::Result<()> {
    info!("accepting connections");
    loop {
        let (stream, peer) = tokio::select! {
            () = token.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        debug!(%peer, "connection accepted");
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(error) = serve_connection(stream, handler.as_ref()).await {
                warn!(%peer, %error, "connection failed");
            }
        });
    }
    info!("stopped accepting connections");
    Ok(())
}

/// Connects to the listed address of the destination for every request.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    addresses: Arc<BTreeMap<NodeId, String>>,
}

impl TcpTransport {
    pub fn new<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Self {
        let addresses = nodes
            .into_iter()
            .map(|node| (node.id.clone(), node.address.clone()))
            .collect();
        Self {
            addresses: Arc::new(addresses),
        }
    }
}

impl NodeTransport for TcpTransport {
    async fn send(
        &self,
        to: NodeId,
        envelope: NodeEnvelope,
    ) -> Result<NodeResponse, Report<TransportError>> {
        let Some(address) = self.addresses.get(&to) else {
            return Err(Report::new(TransportError).attach_printable(format!("unknown node {to}")));
        };
        let stream = TcpStream::connect(address.as_str())
            .await
            .change_context(TransportError)
            .attach_printable_lazy(|| format!("connecting to {to} at {address}"))?;
        stream.set_nodelay(true).change_context(TransportError)?;
        exchange(stream, envelope).await
    }
}

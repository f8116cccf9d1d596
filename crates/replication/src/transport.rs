use crate::{ReplicationMessage, ReplicationResponse};
use async_trait::async_trait;
use futures::future::join_all;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Path peers expose for inbound events.
pub const REPLICATION_PATH: &str = "/replication";

/// Header carrying the shared peer secret.
pub const PEER_TOKEN_HEADER: &str = "x-fidoreg-peer-token";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },
    #[error("peer {0} dropped the request")]
    Closed(String),
    #[error("invalid response from {peer}: {reason}")]
    InvalidResponse { peer: String, reason: String },
}

/// Delivery of one event to every configured peer.
///
/// Returns `Ok(None)` when there is nobody to deliver to. With peers, the
/// answer is the first failure response, or a success once all peers have
/// acknowledged.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    async fn publish(
        &self,
        message: &ReplicationMessage,
    ) -> Result<Option<ReplicationResponse>, TransportError>;
}

fn merge(
    results: Vec<Result<ReplicationResponse, TransportError>>,
) -> Result<Option<ReplicationResponse>, TransportError> {
    if results.is_empty() {
        return Ok(None);
    }
    let peers = results.len();
    for result in results {
        let response = result?;
        if !response.status {
            return Ok(Some(response));
        }
    }
    Ok(Some(ReplicationResponse::ok(format!(
        "acknowledged by {peers} peer(s)"
    ))))
}

/// A request handed to an in-process peer.
#[derive(Debug)]
pub struct Envelope {
    pub message: ReplicationMessage,
    pub reply: oneshot::Sender<ReplicationResponse>,
}

/// Peers living in the same process, reached over tokio channels.
#[derive(Default)]
pub struct ChannelTransport {
    peers: Vec<(String, mpsc::Sender<Envelope>)>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and return the inbox it should drain.
    pub fn add_peer(&mut self, name: impl Into<String>, capacity: usize) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(capacity);
        self.peers.push((name.into(), tx));
        rx
    }

    async fn deliver(
        peer: &str,
        sender: &mpsc::Sender<Envelope>,
        message: &ReplicationMessage,
    ) -> Result<ReplicationResponse, TransportError> {
        let (reply, answer) = oneshot::channel();
        sender
            .send(Envelope {
                message: message.clone(),
                reply,
            })
            .await
            .map_err(|_| TransportError::Closed(peer.to_string()))?;
        answer
            .await
            .map_err(|_| TransportError::Closed(peer.to_string()))
    }
}

#[async_trait]
impl ReplicationTransport for ChannelTransport {
    async fn publish(
        &self,
        message: &ReplicationMessage,
    ) -> Result<Option<ReplicationResponse>, TransportError> {
        let deliveries = self
            .peers
            .iter()
            .map(|(name, sender)| Self::deliver(name, sender, message));
        merge(join_all(deliveries).await)
    }
}

/// Peers reached over HTTP: the event is POSTed as JSON to
/// `{base}/replication` and the body is read back as the acknowledgement.
pub struct HttpTransport {
    client: reqwest::Client,
    peers: Vec<String>,
    peer_token: Option<String>,
}

impl HttpTransport {
    pub fn new(
        peers: Vec<String>,
        request_timeout: Duration,
        peer_token: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            peers,
            peer_token,
        })
    }

    async fn deliver(
        &self,
        peer: &str,
        message: &ReplicationMessage,
    ) -> Result<ReplicationResponse, TransportError> {
        let url = format!("{}{}", peer.trim_end_matches('/'), REPLICATION_PATH);
        let unreachable = |e: reqwest::Error| TransportError::Unreachable {
            peer: peer.to_string(),
            reason: e.to_string(),
        };
        let mut request = self.client.post(&url).json(message);
        if let Some(token) = &self.peer_token {
            request = request.header(PEER_TOKEN_HEADER, token);
        }
        let response = request.send().await.map_err(unreachable)?;

        let status = response.status();
        let body = response.text().await.map_err(unreachable)?;
        match serde_json::from_str::<ReplicationResponse>(&body) {
            Ok(ack) => Ok(ack),
            Err(_) if !status.is_success() => Ok(ReplicationResponse::failed(format!(
                "peer answered {status}"
            ))),
            Err(e) => Err(TransportError::InvalidResponse {
                peer: peer.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ReplicationTransport for HttpTransport {
    async fn publish(
        &self,
        message: &ReplicationMessage,
    ) -> Result<Option<ReplicationResponse>, TransportError> {
        let deliveries = self.peers.iter().map(|peer| self.deliver(peer, message));
        merge(join_all(deliveries).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_reports_first_failure() {
        assert!(merge(Vec::new()).unwrap().is_none());

        let merged = merge(vec![
            Ok(ReplicationResponse::ok("a")),
            Ok(ReplicationResponse::failed("b")),
            Ok(ReplicationResponse::failed("c")),
        ])
        .unwrap()
        .unwrap();
        assert_eq!(merged, ReplicationResponse::failed("b"));

        let err = merge(vec![
            Ok(ReplicationResponse::ok("a")),
            Err(TransportError::Closed("peer-2".into())),
        ])
        .unwrap_err();
        assert!(matches!(err, TransportError::Closed(p) if p == "peer-2"));
    }

    #[tokio::test]
    async fn http_transport_reports_unreachable_peer() {
        let transport = HttpTransport::new(
            vec!["http://127.0.0.1:9".to_string()],
            Duration::from_millis(500),
            Some("secret".to_string()),
        )
        .unwrap();
        let message = ReplicationMessage {
            origin: 1,
            sequence: 1,
            entity: crate::EntityType::FidoKey,
            operation: crate::Operation::Add,
            primary_key: "1-1-alice-1".into(),
            payload: serde_json::Value::Null,
            issued_at: fidoreg_types::now_seconds(),
        };
        let err = transport.publish(&message).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }
}

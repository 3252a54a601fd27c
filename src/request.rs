//! Outbound request bookkeeping (spec.md §3, §4.F).

use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::envelope::{DecodedMessage, MessageKind};
use crate::error::TransportError;
use crate::peer::BoundPeer;

/// Maximum retry attempts before a request is discarded (spec.md §3, §8
/// property 4).
pub const MAX_RETRIES: u32 = 10;

pub type Completion = oneshot::Sender<Result<Vec<DecodedMessage>, TransportError>>;

/// A pending outbound request. Created on `SendWithReply`, destroyed when
/// `completion` resolves (success, timeout, cancellation, or final
/// failure).
pub struct MessageRequest {
    pub id: Uuid,
    pub kind: MessageKind,
    pub body: Vec<Vec<u8>>,
    pub peer: BoundPeer,
    pub enqueued_at: std::time::Instant,
    pub timeout: Duration,
    pub expected_replies: usize,
    pub completion: Option<Completion>,
    pub retries: u32,
}

impl MessageRequest {
    pub fn new(
        kind: MessageKind,
        body: Vec<Vec<u8>>,
        peer: BoundPeer,
        timeout: Duration,
        expected_replies: usize,
        completion: Completion,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            body,
            peer,
            enqueued_at: std::time::Instant::now(),
            timeout,
            expected_replies,
            completion: Some(completion),
            retries: 0,
        }
    }

    pub fn retryable(&self) -> bool {
        self.retries < MAX_RETRIES
    }

    /// Build a copy of this request for requeueing, with `retries`
    /// incremented and the same completion handle (spec.md §4.E: "Requeue a
    /// copy with retries+1").
    pub fn retry_copy(mut self) -> Self {
        self.retries += 1;
        self.enqueued_at = std::time::Instant::now();
        self
    }

    pub fn resolve(mut self, result: Result<Vec<DecodedMessage>, TransportError>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeys;
    use crate::peer::{AppProtocolVersion, Peer};

    fn bound_peer() -> BoundPeer {
        let keys = IdentityKeys::generate();
        let peer = Peer::new(keys.identity(), AppProtocolVersion::new(1, vec![], vec![], vec![]));
        BoundPeer::new(peer, "127.0.0.1", 9000)
    }

    #[test]
    fn retry_copy_increments_retries_and_preserves_id() {
        let (tx, _rx) = oneshot::channel();
        let request = MessageRequest::new(
            MessageKind::Ping,
            vec![],
            bound_peer(),
            Duration::from_secs(1),
            1,
            tx,
        );
        let id = request.id;
        let retried = request.retry_copy();
        assert_eq!(retried.id, id);
        assert_eq!(retried.retries, 1);
    }

    #[test]
    fn exhausts_retryable_at_max_retries() {
        let (tx, _rx) = oneshot::channel();
        let mut request = MessageRequest::new(
            MessageKind::Ping,
            vec![],
            bound_peer(),
            Duration::from_secs(1),
            1,
            tx,
        );
        request.retries = MAX_RETRIES;
        assert!(!request.retryable());
    }
}

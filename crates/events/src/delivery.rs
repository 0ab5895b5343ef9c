/// One delivery of a published message to a consumer.
///
/// The same message may be delivered more than once (at-least-once). A
/// delivery stays outstanding until the consumer acknowledges it; an
/// unacknowledged delivery is handed out again after a consumer restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<M> {
    id: String,
    partition: u32,
    key: String,
    redelivered: bool,
    payload: M,
}

impl<M> Delivery<M> {
    pub fn new(
        id: impl Into<String>,
        partition: u32,
        key: impl Into<String>,
        redelivered: bool,
        payload: M,
    ) -> Self {
        Self {
            id: id.into(),
            partition,
            key: key.into(),
            redelivered,
            payload,
        }
    }

    /// Transport-assigned id used to acknowledge this delivery.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Key the message was published under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this message was handed out before without an ack.
    pub fn is_redelivery(&self) -> bool {
        self.redelivered
    }

    pub fn payload(&self) -> &M {
        &self.payload
    }

    pub fn into_payload(self) -> M {
        self.payload
    }
}

/// The broker's answer to one publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// Accepted, but sent back as unroutable because the publish was `mandatory`.
    Returned,
    /// Confirms are disabled, unsupported by the broker, or were lost with the channel.
    NotRequested,
}

impl Confirmation {
    pub fn is_ack(&self) -> bool {
        matches!(self, Confirmation::Ack)
    }

    pub fn is_nack(&self) -> bool {
        matches!(self, Confirmation::Nack)
    }

    pub fn is_returned(&self) -> bool {
        matches!(self, Confirmation::Returned)
    }
}

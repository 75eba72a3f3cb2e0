//! Offer/answer negotiation state, kept separate from the WebRTC driver so
//! the transitions are testable without a network.
//!
//! Candidates are generic: the driver instantiates `Negotiation` with the
//! real ICE candidate type, tests with anything cheap. Candidates that
//! arrive before the remote description is applied are queued here and
//! drained afterwards; applying a candidate to a connection with no remote
//! description is a hard error in the underlying stack.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NegotiationError {
    /// Both sides sent an offer. With exactly two peers and one designated
    /// caller this cannot happen in a correct deployment, so it is treated
    /// as fatal misconfiguration rather than resolved by tie-break.
    #[error("negotiation glare: received an offer while our own offer is outstanding")]
    GlareDetected,
    #[error("unexpected {got} in phase {phase:?}")]
    UnexpectedSignal { got: &'static str, phase: Phase },
}

pub struct Negotiation<C> {
    phase: Phase,
    remote_description_set: bool,
    pending_candidates: Vec<C>,
}

impl<C> Negotiation<C> {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The caller records that its offer is on the wire.
    pub fn begin_offer(&mut self) -> Result<(), NegotiationError> {
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::OfferSent;
                Ok(())
            }
            phase => Err(NegotiationError::UnexpectedSignal {
                got: "begin_offer",
                phase,
            }),
        }
    }

    /// An offer arrived from the remote side.
    pub fn on_offer(&mut self) -> Result<(), NegotiationError> {
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::OfferReceived;
                Ok(())
            }
            Phase::OfferSent => Err(NegotiationError::GlareDetected),
            phase => Err(NegotiationError::UnexpectedSignal {
                got: "offer",
                phase,
            }),
        }
    }

    /// The responder records that its answer is on the wire.
    pub fn answer_sent(&mut self) -> Result<(), NegotiationError> {
        match self.phase {
            Phase::OfferReceived => {
                self.phase = Phase::AnswerSent;
                Ok(())
            }
            phase => Err(NegotiationError::UnexpectedSignal {
                got: "answer_sent",
                phase,
            }),
        }
    }

    /// An answer arrived from the remote side.
    pub fn on_answer(&mut self) -> Result<(), NegotiationError> {
        match self.phase {
            Phase::OfferSent => Ok(()),
            phase => Err(NegotiationError::UnexpectedSignal {
                got: "answer",
                phase,
            }),
        }
    }

    /// Returns the candidate back if it can be applied now, or queues it
    /// until `remote_description_applied` is called.
    pub fn on_candidate(&mut self, candidate: C) -> Option<C> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.pending_candidates.push(candidate);
            None
        }
    }

    /// Marks the remote description as applied and drains the queue in
    /// arrival order.
    pub fn remote_description_applied(&mut self) -> Vec<C> {
        self.remote_description_set = true;
        std::mem::take(&mut self.pending_candidates)
    }

    /// The data channel opened; negotiation is done. Returns false for
    /// duplicate open notifications.
    pub fn channel_open(&mut self) -> bool {
        match self.phase {
            Phase::OfferSent | Phase::OfferReceived | Phase::AnswerSent => {
                self.phase = Phase::Connected;
                true
            }
            _ => false,
        }
    }

    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.pending_candidates.clear();
    }
}

impl<C> Default for Negotiation<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub mod collaborator;
pub mod fsm;
pub mod protocol;

pub use self::{
    collaborator::{MessageStore, OutcomeRecorder, Subscriber, SubscriberDirectory},
    fsm::FiniteStateMachine,
    protocol::{Protocol, SessionHandler},
};

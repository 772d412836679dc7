use thiserror::Error;

use crate::consumer::ConsumerState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Consumer not ready. topic={topic}, state={state}")]
    NotReady { topic: String, state: ConsumerState },

    #[error("Cannot start consumer. topic={topic} - {reason}")]
    CannotStart { topic: String, reason: String },

    #[error("Consumer is shut down. topic={topic}")]
    ShutDown { topic: String },

    #[error("Topic is already consumed by another consumer. topic={topic}, holder={holder}")]
    TopicInUse { topic: String, holder: String },

    #[error("Offset Source Error - {0}")]
    OffsetSource(String),

    #[error("Reader Error - {0}")]
    Reader(String),

    #[error("Close Error - {0}")]
    Close(String),

    #[error("Handler Error - {0}")]
    Handler(String),

    #[error("Config Error - {0}")]
    Config(String),
}

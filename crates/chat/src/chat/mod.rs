/// Stream folding and cache write-through.
pub mod accumulator;
/// Message domain types and the ordered history.
pub mod message;

pub use accumulator::{FoldEffect, StreamAccumulator, fold_event, reduce};
pub use message::{ConversationHistory, Message, MessageId, MessageStatus, Role};

pub mod conversation;
pub mod message;

pub use conversation::{canonical_pair, Conversation, ConversationSummary};
pub use message::{
    Attachment, Message, NewClassMessage, NewDirectMessage, Page, ReceiptStatus,
};

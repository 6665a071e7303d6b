//! 记忆层：对话存储与相关记忆检索（均为外部协作方接口 + 内存实现）

pub mod conversation;
pub mod long_term;

pub use conversation::{Conversation, ConversationStore, InMemoryConversationStore, Message, Role};
pub use long_term::{InMemoryLongTerm, MemoryProvider, NoopMemory};

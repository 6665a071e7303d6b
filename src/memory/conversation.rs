//! 对话存储
//!
//! ConversationStore 为引擎消费的接口：get_by_id 取回对话上下文，append_message 尽力写回（失败只记录日志）。
//! InMemoryConversationStore 为默认实现。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    /// 最近 n 条消息
    pub fn excerpt(&self, n: usize) -> Vec<Message> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..].to_vec()
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Option<Conversation>;

    async fn append_message(&self, id: &str, text: &str, role: Role) -> Result<(), String>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建空对话并返回 id
    pub async fn create(&self, title: impl Into<String>) -> String {
        let id = format!("conv_{}", uuid::Uuid::new_v4());
        let conv = Conversation {
            id: id.clone(),
            title: title.into(),
            messages: Vec::new(),
        };
        self.conversations.write().await.insert(id.clone(), conv);
        id
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_by_id(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(id).cloned()
    }

    async fn append_message(&self, id: &str, text: &str, role: Role) -> Result<(), String> {
        let mut convs = self.conversations.write().await;
        let conv = convs
            .get_mut(id)
            .ok_or_else(|| format!("conversation {id} not found"))?;
        conv.messages.push(Message::new(role, text));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_append_and_excerpt() {
        let store = InMemoryConversationStore::new();
        let id = store.create("demo").await;
        for i in 0..4 {
            store
                .append_message(&id, &format!("m{i}"), Role::User)
                .await
                .unwrap();
        }
        let conv = store.get_by_id(&id).await.unwrap();
        let excerpt = conv.excerpt(2);
        assert_eq!(excerpt, vec![Message::new(Role::User, "m2"), Message::new(Role::User, "m3")]);
        assert_eq!(conv.excerpt(10).len(), 4);
    }

    #[tokio::test]
    async fn test_missing_conversation() {
        let store = InMemoryConversationStore::new();
        assert!(store.get_by_id("nope").await.is_none());
        assert!(store.append_message("nope", "x", Role::Assistant).await.is_err());
    }
}

//! 相关记忆检索
//!
//! MemoryProvider 为引擎消费的接口（find_related(task, k)，片段对引擎不透明）；
//! InMemoryLongTerm 按关键词重叠检索，适合本地运行与测试。

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn find_related(&self, task: &str, k: usize) -> Vec<String>;
}

/// 空实现：未启用记忆时使用
#[derive(Clone, Default)]
pub struct NoopMemory;

#[async_trait]
impl MemoryProvider for NoopMemory {
    async fn find_related(&self, _task: &str, _k: usize) -> Vec<String> {
        Vec::new()
    }
}

/// (text, 小写词集合)；超出 max_entries 时丢弃最旧条目
#[derive(Clone)]
pub struct InMemoryLongTerm {
    store: Arc<RwLock<Vec<(String, HashSet<String>)>>>,
    max_entries: usize,
}

fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

impl InMemoryLongTerm {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(Vec::new())),
            max_entries: max_entries.max(1),
        }
    }

    pub fn add(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let tokens = tokenize_lower(text);
        let Ok(mut store) = self.store.write() else {
            return;
        };
        store.push((text.to_string(), tokens));
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl MemoryProvider for InMemoryLongTerm {
    async fn find_related(&self, task: &str, k: usize) -> Vec<String> {
        let query_tokens = tokenize_lower(task);
        if query_tokens.is_empty() || k == 0 {
            return Vec::new();
        }
        let Ok(store) = self.store.read() else {
            return Vec::new();
        };
        // 分数相同时新条目优先
        let mut scored: Vec<(usize, usize, &String)> = store
            .iter()
            .enumerate()
            .map(|(i, (text, doc))| (query_tokens.intersection(doc).count(), i, text))
            .filter(|(s, _, _)| *s > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        scored.into_iter().take(k).map(|(_, _, t)| t.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_related_ranks_by_overlap() {
        let mem = InMemoryLongTerm::new(10);
        mem.add("deploy the web service to staging");
        mem.add("rust build cache cleanup");
        mem.add("web service health check failed on staging");

        let hits = mem.find_related("check staging web service", 2).await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0], "web service health check failed on staging");
        assert!(mem.find_related("unrelated words", 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let mem = InMemoryLongTerm::new(2);
        mem.add("alpha one");
        mem.add("beta two");
        mem.add("gamma three");
        assert_eq!(mem.len(), 2);
        assert!(mem.find_related("alpha", 5).await.is_empty());
    }
}

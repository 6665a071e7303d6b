//! 推理响应的容错解码
//!
//! 固定回退顺序：``` 代码块 -> 整体解析（以 `{` / `[` 开头时）-> 有界的对象扫描（从前 MAX_SCAN_CANDIDATES 个 `{` / `[` 起做括号配平）。
//! 任何一级成功即返回；全部失败时给出最后一次的解析错误。

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// 对象扫描最多尝试的起始位置数
const MAX_SCAN_CANDIDATES: usize = 16;
/// 单个起始位置最多向后扫描的字节数
const MAX_SCAN_BYTES: usize = 64 * 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("empty response")]
    Empty,
    #[error("no structured payload found in response")]
    NotFound,
    #[error("invalid payload: {0}")]
    Invalid(String),
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").expect("fence regex is valid")
    })
}

/// 从自由文本中解出 T
pub fn decode_payload<T: DeserializeOwned>(text: &str) -> Result<T, DecodeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut last_err: Option<DecodeError> = None;
    let mut attempt = |candidate: &str| -> Option<T> {
        match serde_json::from_str::<T>(candidate) {
            Ok(v) => Some(v),
            Err(e) => {
                last_err = Some(DecodeError::Invalid(e.to_string()));
                None
            }
        }
    };

    for caps in fence_regex().captures_iter(trimmed) {
        if let Some(body) = caps.get(1) {
            if let Some(v) = attempt(body.as_str().trim()) {
                return Ok(v);
            }
        }
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Some(v) = attempt(trimmed) {
            return Ok(v);
        }
    }

    for candidate in scan_candidates(trimmed) {
        if let Some(v) = attempt(candidate) {
            return Ok(v);
        }
    }

    Err(last_err.unwrap_or(DecodeError::NotFound))
}

/// 以前 MAX_SCAN_CANDIDATES 个 `{` / `[` 为起点，配平到对应的闭括号（跳过字符串内的括号）
fn scan_candidates(text: &str) -> impl Iterator<Item = &str> {
    text.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .take(MAX_SCAN_CANDIDATES)
        .filter_map(move |(start, _)| balanced_end(text, start).map(|end| &text[start..end]))
}

fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if i >= MAX_SCAN_BYTES {
            return None;
        }
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

use std::path::Path;

use anyhow::{anyhow, Result};
use tokenizers::Tokenizer;

/// token 计数：配置了 tokenizer.json 时精确计数，否则按字符估算
pub struct TokenCounter {
    tokenizer: Option<Tokenizer>,
}

impl TokenCounter {
    pub fn heuristic() -> Self {
        Self { tokenizer: None }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Error loading tokenizer {}: {e}", path.display()))?;
        Ok(Self {
            tokenizer: Some(tokenizer),
        })
    }

    /// 加载失败时退回估算并记录警告
    pub fn from_optional_path(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::from_file(path).unwrap_or_else(|e| {
                tracing::warn!("{e:#}; falling back to estimated token counts");
                Self::heuristic()
            }),
            None => Self::heuristic(),
        }
    }

    pub fn is_exact(&self) -> bool {
        self.tokenizer.is_some()
    }

    pub fn count(&self, text: &str) -> usize {
        if let Some(tokenizer) = &self.tokenizer {
            match tokenizer.encode(text, false) {
                Ok(encoding) => return encoding.get_ids().len(),
                Err(e) => tracing::debug!("Error encoding with tokenizer: {e}"),
            }
        }
        estimate_tokens(text)
    }
}

/// 中文约 2 字符一个 token，其他约 4 字符一个，至少为 1
pub fn estimate_tokens(text: &str) -> usize {
    let (cjk, other) = text.chars().fold((0usize, 0usize), |(cjk, other), c| {
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });
    (cjk / 2 + other / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_counts_cjk_and_latin() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("你好世界"), 2);
        // 4 个汉字 + 8 个其他字符
        assert_eq!(estimate_tokens("你好世界 hello!!"), 2 + 2);
    }

    #[test]
    fn missing_tokenizer_falls_back() {
        let counter = TokenCounter::from_optional_path(Some(Path::new("/no/such/tokenizer.json")));
        assert!(!counter.is_exact());
        assert_eq!(counter.count("abcdefgh"), 2);
    }
}

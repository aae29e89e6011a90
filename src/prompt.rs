//! ChatML 提示词构造与多模态内容拆分

use serde_json::Value;

use crate::engine::ChatTurn;
use crate::types::ChatMessage;

pub const VALID_ROLES: &[&str] = &["system", "user", "assistant", "function", "tool"];

/// 取出消息里的文本；数组内容只拼接 `type == "text"` 的部分
pub fn message_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// 非文本部分（图片、音频等）原样交给引擎
pub fn multimodal_parts(messages: &[ChatMessage]) -> Option<Vec<Value>> {
    let parts: Vec<Value> = messages
        .iter()
        .filter_map(|m| m.content.as_ref().and_then(Value::as_array))
        .flatten()
        .filter(|p| p.is_object() && p.get("type").and_then(Value::as_str) != Some("text"))
        .cloned()
        .collect();
    (!parts.is_empty()).then_some(parts)
}

pub fn chat_turns(messages: &[ChatMessage]) -> Vec<ChatTurn> {
    messages
        .iter()
        .map(|m| ChatTurn {
            role: m.role.clone(),
            content: message_text(m.content.as_ref()),
        })
        .collect()
}

/// `<|im_start|>role\n内容<|im_end|>`，最后以 assistant 起始标记结尾
pub fn build_chat_prompt(messages: &[ChatMessage]) -> String {
    let mut parts: Vec<String> = messages
        .iter()
        .filter_map(|m| {
            let content = message_text(m.content.as_ref());
            let header = match m.role.as_str() {
                "system" | "user" | "assistant" | "tool" => m.role.clone(),
                "function" => format!("function name={}", m.name.as_deref().unwrap_or("function")),
                _ => return None,
            };
            Some(format!("<|im_start|>{header}\n{content}<|im_end|>"))
        })
        .collect();
    parts.push("<|im_start|>assistant\n".to_string());
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(role: &str, content: Value) -> ChatMessage {
        serde_json::from_value(json!({"role": role, "content": content})).unwrap()
    }

    #[test]
    fn builds_chatml() {
        let messages = vec![msg("system", json!("be brief")), msg("user", json!("hi"))];
        assert_eq!(
            build_chat_prompt(&messages),
            "<|im_start|>system\nbe brief<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn multipart_content_splits_text_and_media() {
        let messages = vec![msg(
            "user",
            json!([
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                {"type": "text", "text": "?"}
            ]),
        )];
        assert_eq!(message_text(messages[0].content.as_ref()), "what is this\n?");
        let media = multimodal_parts(&messages).unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0]["type"], "image_url");
        assert!(multimodal_parts(&[msg("user", json!("plain"))]).is_none());
    }

    #[test]
    fn function_messages_carry_name() {
        let mut m = msg("function", json!("42"));
        m.name = Some("calc".into());
        assert!(build_chat_prompt(&[m]).starts_with("<|im_start|>function name=calc\n42"));
    }
}

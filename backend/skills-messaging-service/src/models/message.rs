use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
}

/// Message row as stored.
///
/// Direct messages carry `conversation_id`, `receiver_id` and `sequence_number`;
/// class messages carry `class_id` and none of the three.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub class_id: Option<Uuid>,
    pub sequence_number: Option<i64>,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub parent_id: Option<Uuid>,
    pub server_timestamp: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_direct(&self) -> bool {
        self.conversation_id.is_some()
    }

    /// Status as the sender should see it; never regresses from read to delivered
    pub fn receipt_status(&self) -> Option<ReceiptStatus> {
        if self.read_at.is_some() {
            Some(ReceiptStatus::Read)
        } else if self.delivered_at.is_some() {
            Some(ReceiptStatus::Delivered)
        } else {
            None
        }
    }

    pub fn preview(&self) -> String {
        preview_of(&self.content, &self.attachments)
    }
}

pub fn preview_of(content: &str, attachments: &[Attachment]) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() && !attachments.is_empty() {
        return format!("[{} attachment(s)]", attachments.len());
    }
    trimmed.chars().take(PREVIEW_CHARS).collect()
}

#[derive(Debug, Clone)]
pub struct NewDirectMessage {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct NewClassMessage {
    pub sender_id: Uuid,
    pub class_id: Uuid,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Delivered,
    Read,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Delivered => "delivered",
            ReceiptStatus::Read => "read",
        }
    }
}

/// 1-based pagination, shared by list endpoints
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default = "Page::default_page")]
    pub page: u32,
    #[serde(default = "Page::default_limit")]
    pub limit: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 200;

    fn default_page() -> u32 {
        1
    }

    fn default_limit() -> u32 {
        50
    }

    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }.normalized()
    }

    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            limit: self.limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        let p = self.normalized();
        i64::from(p.page - 1) * i64::from(p.limit)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.normalized().limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: Self::default_page(),
            limit: Self::default_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_normalization() {
        let p = Page::new(0, 10_000);
        assert_eq!(p.page, 1);
        assert_eq!(p.limit, Page::MAX_LIMIT);
        assert_eq!(Page::new(3, 20).offset(), 40);
    }

    #[test]
    fn test_preview_truncates_and_describes_attachments() {
        let long = "x".repeat(250);
        assert_eq!(preview_of(&long, &[]).chars().count(), 100);

        let att = Attachment {
            url: "https://cdn/a.png".into(),
            kind: "image".into(),
            name: None,
            size_bytes: None,
        };
        assert_eq!(preview_of("  ", &[att]), "[1 attachment(s)]");
    }

    #[test]
    fn test_attachment_wire_format() {
        let att: Attachment =
            serde_json::from_str(r#"{"url":"https://cdn/f.pdf","type":"file"}"#).unwrap();
        assert_eq!(att.kind, "file");
        assert!(att.name.is_none());
    }
}

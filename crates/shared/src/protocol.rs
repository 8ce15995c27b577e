use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CampaignId, CampaignStatus, ContactId, EmailKind, EmailLogId, EmailStatus, TemplateId, UserId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(rename = "_id")]
    pub id: ContactId,
    pub company: String,
    pub full_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(default)]
    pub unsubscribed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Create/update payload for a contact; the server assigns the id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDraft {
    pub company: String,
    pub full_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
}

/// Pagination block returned by the directory-style list endpoints.
/// `page` is 1-indexed; `total_pages = ceil(total_items / limit)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub total_pages: u32,
    pub total_items: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(rename = "_id")]
    pub id: TemplateId,
    pub name: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub name: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    #[serde(rename = "_id")]
    pub id: CampaignId,
    pub name: String,
    pub subject: String,
    pub html: String,
    pub status: CampaignStatus,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignDraft {
    pub name: String,
    pub subject: String,
    pub html: String,
    pub contact_ids: Vec<ContactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleSendRequest {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendRequest {
    pub recipients: Vec<String>,
    pub subject: String,
    pub html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

/// Per-recipient outcome report for a bulk send.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkSendOutcome {
    #[serde(default)]
    pub successful: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

/// Envelope the bulk-send endpoint wraps its outcome report in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkSendResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub results: BulkSendOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailLogEntry {
    #[serde(rename = "_id")]
    pub id: EmailLogId,
    pub to: String,
    pub subject: String,
    pub status: EmailStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "type")]
    pub kind: EmailKind,
    pub created_at: DateTime<Utc>,
}

/// History pagination carries cursor hints the directory endpoints do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPagination {
    pub current_page: u32,
    pub total_pages: u32,
    pub total_items: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailHistoryPage {
    #[serde(default)]
    pub emails: Vec<EmailLogEntry>,
    pub pagination: HistoryPagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsSettings {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub from_email: String,
    pub from_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lint report for a subject/body pair before sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentReport {
    pub valid: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Server-rendered preview with merge tags substituted for a sample contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedPreview {
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeStatus {
    pub email: String,
    pub unsubscribed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(rename = "_id")]
    pub id: UserId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateProfileRequest {
    pub email: String,
}

/// Bulk lookup request for `/contacts/by-ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<ContactId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvImportReport {
    pub imported: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUploadResult {
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_parses_backend_shape() {
        let raw = r#"{
            "_id": "665f1c2e9b1d8a0012ab34cd",
            "company": "Example Corp",
            "fullName": "John Doe",
            "email": "john@example.com",
            "workPhone": "+1234567890",
            "city": "New York",
            "createdAt": "2024-06-04T12:00:00Z"
        }"#;

        let contact: Contact = serde_json::from_str(raw).expect("contact json");
        assert_eq!(contact.id.0, "665f1c2e9b1d8a0012ab34cd");
        assert_eq!(contact.full_name, "John Doe");
        assert_eq!(contact.work_phone.as_deref(), Some("+1234567890"));
        assert!(!contact.unsubscribed);
        assert!(contact.mobile_phone.is_none());
    }

    #[test]
    fn page_parses_pagination_block() {
        let raw = r#"{
            "items": [],
            "pagination": { "page": 2, "totalPages": 5, "totalItems": 47 }
        }"#;

        let page: Page<Contact> = serde_json::from_str(raw).expect("page json");
        assert_eq!(page.pagination.page, 2);
        assert_eq!(page.pagination.total_pages, 5);
        assert_eq!(page.pagination.total_items, 47);
    }

    #[test]
    fn email_log_maps_type_field_to_kind() {
        let raw = r#"{
            "_id": "abc",
            "to": "jane@example.com",
            "subject": "Hello",
            "status": "sent",
            "type": "bulk",
            "createdAt": "2024-06-04T12:00:00Z"
        }"#;

        let entry: EmailLogEntry = serde_json::from_str(raw).expect("log json");
        assert_eq!(entry.kind, EmailKind::Bulk);
        assert_eq!(entry.status, EmailStatus::Sent);
    }

    #[test]
    fn draft_serializes_camel_case_and_skips_empty_optionals() {
        let draft = ContactDraft {
            company: "Acme".into(),
            full_name: "Ada Lovelace".into(),
            email: "ada@acme.test".into(),
            ..ContactDraft::default()
        };

        let value = serde_json::to_value(&draft).expect("draft json");
        assert_eq!(value["fullName"], "Ada Lovelace");
        assert!(value.get("workPhone").is_none());
    }
}

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{CampaignId, ContactId, TemplateId, UserId},
    error::ErrorBody,
    protocol::{
        AuthResponse, AwsSettings, BulkSendOutcome, BulkSendRequest, BulkSendResponse, Campaign,
        CampaignDraft, ChangePasswordRequest, Contact, ContactDraft, ContentReport,
        CsvImportReport, EmailHistoryPage, IdsRequest, ImageUploadResult, LoginRequest, Page,
        RegisterRequest, RenderedPreview, SingleSendRequest, Template, TemplateDraft,
        UnsubscribeStatus, UpdateProfileRequest, UserProfile, VerifyOutcome,
    },
};
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub mod error;
pub mod selection;
pub mod session;

pub use error::ClientError;
pub use selection::{
    PageWindow, RecipientSelection, SelectAllMode, SelectionEvent, FETCH_ALL_PAGE_SIZE,
    SEARCH_DEBOUNCE,
};
pub use session::Session;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Campaigns at or above this many recipients go through the batch-create
/// endpoint instead of the plain one.
pub const BATCH_CAMPAIGN_THRESHOLD: usize = 1000;
/// Per-batch recipient count the backend is asked to send with.
pub const DEFAULT_SEND_BATCH_SIZE: u32 = 50;

/// Paginated, searchable remote contact list. The client never caches
/// beyond the page it was asked for; the directory is authoritative.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn list(&self, page: u32, limit: u32, search: Option<&str>) -> Result<Page<Contact>>;
    async fn list_by_ids(&self, ids: &[ContactId]) -> Result<Vec<Contact>>;
    async fn list_unsubscribed(
        &self,
        page: u32,
        limit: u32,
        search: Option<&str>,
    ) -> Result<Page<Contact>>;
}

pub struct MissingContactDirectory;

#[async_trait]
impl ContactDirectory for MissingContactDirectory {
    async fn list(&self, _page: u32, _limit: u32, _search: Option<&str>) -> Result<Page<Contact>> {
        Err(ClientError::Unavailable("contact directory"))
    }

    async fn list_by_ids(&self, _ids: &[ContactId]) -> Result<Vec<Contact>> {
        Err(ClientError::Unavailable("contact directory"))
    }

    async fn list_unsubscribed(
        &self,
        _page: u32,
        _limit: u32,
        _search: Option<&str>,
    ) -> Result<Page<Contact>> {
        Err(ClientError::Unavailable("contact directory"))
    }
}

/// Submission collaborator: bulk sends and campaign creation.
#[async_trait]
pub trait CampaignOutbox: Send + Sync {
    async fn send_bulk(&self, request: BulkSendRequest) -> Result<BulkSendOutcome>;
    async fn create_campaign(&self, draft: CampaignDraft) -> Result<Campaign>;
    async fn create_campaign_batch(&self, draft: CampaignDraft, batch_size: u32)
        -> Result<Campaign>;
}

pub struct MissingCampaignOutbox;

#[async_trait]
impl CampaignOutbox for MissingCampaignOutbox {
    async fn send_bulk(&self, _request: BulkSendRequest) -> Result<BulkSendOutcome> {
        Err(ClientError::Unavailable("campaign outbox"))
    }

    async fn create_campaign(&self, _draft: CampaignDraft) -> Result<Campaign> {
        Err(ClientError::Unavailable("campaign outbox"))
    }

    async fn create_campaign_batch(
        &self,
        _draft: CampaignDraft,
        _batch_size: u32,
    ) -> Result<Campaign> {
        Err(ClientError::Unavailable("campaign outbox"))
    }
}

/// Routes a campaign through the batch-create endpoint once the recipient
/// list is large enough for the backend to chunk the send itself.
pub async fn submit_campaign(outbox: &dyn CampaignOutbox, draft: CampaignDraft) -> Result<Campaign> {
    if draft.contact_ids.len() >= BATCH_CAMPAIGN_THRESHOLD {
        info!(
            recipients = draft.contact_ids.len(),
            batch_size = DEFAULT_SEND_BATCH_SIZE,
            "campaign: recipient list over threshold, using batch create"
        );
        outbox
            .create_campaign_batch(draft, DEFAULT_SEND_BATCH_SIZE)
            .await
    } else {
        outbox.create_campaign(draft).await
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContactsQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Typed client for the CRM REST backend. All authorized calls read the
/// bearer token from the injected [`Session`]; a 401/403 response revokes
/// the session and surfaces as [`ClientError::AuthExpired`].
#[derive(Debug)]
pub struct CrmClient {
    http: Client,
    base_url: String,
    session: Session,
}

impl CrmClient {
    pub fn new(base_url: &str, session: Session) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|err| ClientError::InvalidBaseUrl(format!("{base_url}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClientError::InvalidBaseUrl(format!(
                "{base_url}: scheme must be http or https"
            )));
        }

        Ok(Self {
            http: Client::new(),
            base_url: parsed.as_str().trim_end_matches('/').to_owned(),
            session,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn tagged(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("x-request-id", Uuid::new_v4().to_string())
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        if self.session.is_revoked() {
            return Err(ClientError::AuthExpired);
        }
        let token = self.session.token().ok_or(ClientError::AuthRequired)?;
        Ok(self.tagged(builder.bearer_auth(token)))
    }

    /// Shared tail of every authorized call: auth rejection revokes the
    /// session, other failures map the backend's `{ message }` body.
    async fn check(&self, builder: RequestBuilder) -> Result<reqwest::Response> {
        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "api: token rejected, revoking session");
            self.session.revoke();
            return Err(ClientError::AuthExpired);
        }

        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.message)
                .unwrap_or_else(|_| "request failed".to_owned());
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn execute<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        Ok(self.check(builder).await?.json::<T>().await?)
    }

    /// Unit calls ignore the success body; a bodiless 204 is as good as a
    /// `{ message }` acknowledgement.
    async fn execute_unit(&self, builder: RequestBuilder) -> Result<()> {
        let response = self.check(builder).await?;
        let _ = response.bytes().await?;
        Ok(())
    }

    /// Unauthenticated endpoints (login/register) never revoke the session;
    /// a 401 there is a credential failure, not a dead token.
    async fn execute_public<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .map(|body| body.message)
                .unwrap_or_else(|_| "request failed".to_owned());
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<T>().await?)
    }

    // --- auth / users ---

    /// Logs in and installs the issued token into the session.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let request = self.tagged(self.http.post(self.endpoint("/auth/login"))).json(
            &LoginRequest {
                email: email.to_owned(),
                password: password.to_owned(),
            },
        );
        let response: AuthResponse = self.execute_public(request).await?;
        self.session.set_token(response.token.clone());
        info!(user = %response.user.email, "auth: logged in");
        Ok(response)
    }

    pub async fn register(&self, email: &str, password: &str, name: &str) -> Result<AuthResponse> {
        let request = self
            .tagged(self.http.post(self.endpoint("/auth/register")))
            .json(&RegisterRequest {
                email: email.to_owned(),
                password: password.to_owned(),
                name: name.to_owned(),
            });
        let response: AuthResponse = self.execute_public(request).await?;
        self.session.set_token(response.token.clone());
        Ok(response)
    }

    pub async fn change_password(&self, current: &str, new: &str) -> Result<()> {
        let request = self
            .authorized(self.http.post(self.endpoint("/auth/change-password")))?
            .json(&ChangePasswordRequest {
                current_password: current.to_owned(),
                new_password: new.to_owned(),
            });
        self.execute_unit(request).await
    }

    pub async fn current_user(&self) -> Result<UserProfile> {
        let request = self.authorized(self.http.get(self.endpoint("/users/me")))?;
        self.execute(request).await
    }

    pub async fn update_current_user(&self, email: &str) -> Result<UserProfile> {
        let request = self
            .authorized(self.http.put(self.endpoint("/users/me")))?
            .json(&UpdateProfileRequest {
                email: email.to_owned(),
            });
        self.execute(request).await
    }

    // --- contacts ---

    pub async fn list_contacts(&self, query: &ContactsQuery) -> Result<Page<Contact>> {
        let request = self
            .authorized(self.http.get(self.endpoint("/contacts")))?
            .query(query);
        self.execute(request).await
    }

    pub async fn create_contact(&self, draft: &ContactDraft) -> Result<Contact> {
        let request = self
            .authorized(self.http.post(self.endpoint("/contacts")))?
            .json(draft);
        self.execute(request).await
    }

    pub async fn update_contact(&self, id: &ContactId, draft: &ContactDraft) -> Result<Contact> {
        let request = self
            .authorized(self.http.put(self.endpoint(&format!("/contacts/{id}"))))?
            .json(draft);
        self.execute(request).await
    }

    pub async fn delete_contact(&self, id: &ContactId) -> Result<()> {
        let request = self.authorized(self.http.delete(self.endpoint(&format!("/contacts/{id}"))))?;
        self.execute_unit(request).await
    }

    /// CSV import; the backend expects a multipart `file` field.
    pub async fn import_contacts_csv(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<CsvImportReport> {
        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_owned())
            .mime_str("text/csv")?;
        let form = multipart::Form::new().part("file", part);
        let request = self
            .authorized(self.http.post(self.endpoint("/contacts/upload")))?
            .multipart(form);
        self.execute(request).await
    }

    pub async fn contacts_by_ids(&self, ids: &[ContactId]) -> Result<Vec<Contact>> {
        let request = self
            .authorized(self.http.post(self.endpoint("/contacts/by-ids")))?
            .json(&IdsRequest { ids: ids.to_vec() });
        self.execute(request).await
    }

    pub async fn list_unsubscribers(&self, query: &ContactsQuery) -> Result<Page<Contact>> {
        let request = self
            .authorized(self.http.get(self.endpoint("/contacts/unsub")))?
            .query(query);
        self.execute(request).await
    }

    // --- templates ---

    pub async fn list_templates(&self) -> Result<Vec<Template>> {
        let request = self.authorized(self.http.get(self.endpoint("/templates")))?;
        self.execute(request).await
    }

    pub async fn create_template(&self, draft: &TemplateDraft) -> Result<Template> {
        let request = self
            .authorized(self.http.post(self.endpoint("/templates")))?
            .json(draft);
        self.execute(request).await
    }

    pub async fn update_template(&self, id: &TemplateId, draft: &TemplateDraft) -> Result<Template> {
        let request = self
            .authorized(self.http.put(self.endpoint(&format!("/templates/{id}"))))?
            .json(draft);
        self.execute(request).await
    }

    pub async fn delete_template(&self, id: &TemplateId) -> Result<()> {
        let request =
            self.authorized(self.http.delete(self.endpoint(&format!("/templates/{id}"))))?;
        self.execute_unit(request).await
    }

    // --- campaigns ---

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        let request = self.authorized(self.http.get(self.endpoint("/campaigns")))?;
        self.execute(request).await
    }

    pub async fn campaign(&self, id: &CampaignId) -> Result<Campaign> {
        let request = self.authorized(self.http.get(self.endpoint(&format!("/campaigns/{id}"))))?;
        self.execute(request).await
    }

    pub async fn update_campaign(&self, id: &CampaignId, draft: &CampaignDraft) -> Result<Campaign> {
        let request = self
            .authorized(self.http.put(self.endpoint(&format!("/campaigns/{id}"))))?
            .json(draft);
        self.execute(request).await
    }

    pub async fn delete_campaign(&self, id: &CampaignId) -> Result<()> {
        let request =
            self.authorized(self.http.delete(self.endpoint(&format!("/campaigns/{id}"))))?;
        self.execute_unit(request).await
    }

    pub async fn send_campaign(&self, id: &CampaignId) -> Result<()> {
        let request =
            self.authorized(self.http.post(self.endpoint(&format!("/campaigns/{id}/send"))))?;
        self.execute_unit(request).await
    }

    // --- email ---

    pub async fn send_single(&self, request_body: &SingleSendRequest) -> Result<()> {
        let request = self
            .authorized(self.http.post(self.endpoint("/email/send")))?
            .json(request_body);
        self.execute_unit(request).await
    }

    pub async fn email_history(&self, query: &HistoryQuery) -> Result<EmailHistoryPage> {
        let request = self
            .authorized(self.http.get(self.endpoint("/email/history")))?
            .query(query);
        self.execute(request).await
    }

    pub async fn send_test(&self) -> Result<()> {
        let request = self.authorized(self.http.post(self.endpoint("/email/test")))?;
        self.execute_unit(request).await
    }

    pub async fn unsubscribe_status(&self, email: &str, user_id: &UserId) -> Result<UnsubscribeStatus> {
        let request = self
            .authorized(self.http.get(self.endpoint("/email/unsubscribe/status")))?
            .query(&[("email", email), ("userId", user_id.0.as_str())]);
        self.execute(request).await
    }

    pub async fn validate_content(&self, subject: &str, html: &str) -> Result<ContentReport> {
        let request = self
            .authorized(self.http.post(self.endpoint("/email/validate")))?
            .json(&serde_json::json!({ "subject": subject, "html": html }));
        self.execute(request).await
    }

    pub async fn preview(
        &self,
        subject: &str,
        html: &str,
        sample_contact: &Contact,
    ) -> Result<RenderedPreview> {
        let request = self
            .authorized(self.http.post(self.endpoint("/email/preview")))?
            .json(&serde_json::json!({
                "subject": subject,
                "html": html,
                "sampleContact": sample_contact,
            }));
        self.execute(request).await
    }

    // --- AWS SES settings ---

    pub async fn aws_settings(&self) -> Result<AwsSettings> {
        let request = self.authorized(self.http.get(self.endpoint("/aws-settings")))?;
        self.execute(request).await
    }

    pub async fn update_aws_settings(&self, settings: &AwsSettings) -> Result<AwsSettings> {
        let request = self
            .authorized(self.http.put(self.endpoint("/aws-settings")))?
            .json(settings);
        self.execute(request).await
    }

    pub async fn verify_aws_settings(&self) -> Result<VerifyOutcome> {
        let request = self.authorized(self.http.put(self.endpoint("/aws-settings/verify")))?;
        self.execute(request).await
    }

    // --- images ---

    pub async fn upload_image(&self, filename: &str, bytes: Vec<u8>) -> Result<ImageUploadResult> {
        let part = multipart::Part::bytes(bytes).file_name(filename.to_owned());
        let form = multipart::Form::new().part("image", part);
        let request = self
            .authorized(self.http.post(self.endpoint("/images/upload")))?
            .multipart(form);
        self.execute(request).await
    }

    pub async fn upload_images(
        &self,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<ImageUploadResult>> {
        let mut form = multipart::Form::new();
        for (filename, bytes) in files {
            form = form.part("images", multipart::Part::bytes(bytes).file_name(filename));
        }
        let request = self
            .authorized(self.http.post(self.endpoint("/images/upload-multiple")))?
            .multipart(form);
        self.execute(request).await
    }
}

#[async_trait]
impl ContactDirectory for CrmClient {
    async fn list(&self, page: u32, limit: u32, search: Option<&str>) -> Result<Page<Contact>> {
        self.list_contacts(&ContactsQuery {
            page: Some(page),
            limit: Some(limit),
            search: search.map(str::to_owned),
            status: None,
        })
        .await
    }

    async fn list_by_ids(&self, ids: &[ContactId]) -> Result<Vec<Contact>> {
        self.contacts_by_ids(ids).await
    }

    async fn list_unsubscribed(
        &self,
        page: u32,
        limit: u32,
        search: Option<&str>,
    ) -> Result<Page<Contact>> {
        self.list_unsubscribers(&ContactsQuery {
            page: Some(page),
            limit: Some(limit),
            search: search.map(str::to_owned),
            status: None,
        })
        .await
    }
}

#[async_trait]
impl CampaignOutbox for CrmClient {
    async fn send_bulk(&self, request_body: BulkSendRequest) -> Result<BulkSendOutcome> {
        let request = self
            .authorized(self.http.post(self.endpoint("/email/send-bulk")))?
            .json(&request_body);
        let response: BulkSendResponse = self.execute(request).await?;
        Ok(response.results)
    }

    async fn create_campaign(&self, draft: CampaignDraft) -> Result<Campaign> {
        let request = self
            .authorized(self.http.post(self.endpoint("/campaigns")))?
            .json(&draft);
        self.execute(request).await
    }

    async fn create_campaign_batch(
        &self,
        mut draft: CampaignDraft,
        batch_size: u32,
    ) -> Result<Campaign> {
        draft.batch_size = Some(batch_size);
        let request = self
            .authorized(self.http.post(self.endpoint("/campaigns/batch")))?
            .json(&draft);
        self.execute(request).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

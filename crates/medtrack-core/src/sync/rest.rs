//! REST client for the Authoritative Store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::store::AuthoritativeStore;
use super::types::{DoseStatusUpdate, ReminderStatusUpdate};
use crate::error::{ConfigError, StoreError};
use crate::model::{
    DoseState, Medication, MedicationDraft, MedicationId, Reminder, ReminderDraft, ReminderId,
};

#[derive(Deserialize)]
struct ReminderEnvelope {
    reminder: Reminder,
}

#[derive(Deserialize)]
struct RemindersEnvelope {
    #[serde(default)]
    reminders: Vec<Reminder>,
}

/// Bearer-authenticated JSON client for the medication/reminder API.
#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base: Url,
    token: String,
}

impl RestStore {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> Result<Self, ConfigError> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base = Url::parse(&normalized).map_err(|e| ConfigError::InvalidValue {
            key: "store.api_base_url".into(),
            message: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "store.request_timeout_secs".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base,
            token: token.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, StoreError> {
        let url = self
            .base
            .join(path)
            .map_err(|e| StoreError::Rejected {
                status: 0,
                message: format!("bad request path '{path}': {e}"),
            })?;
        debug!(%method, %url, "authoritative store request");
        Ok(self.client.request(method, url).bearer_auth(&self.token))
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
        let resp = req.send().await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(error_from_response(resp).await)
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, StoreError> {
        let resp = self.send(req).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Map a non-success response onto the store error taxonomy.
pub(crate) async fn error_from_response(resp: Response) -> StoreError {
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    status_error(status, retry_after, &body)
}

pub(crate) fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> StoreError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());

    match status.as_u16() {
        401 | 403 => StoreError::Unauthorized,
        404 => StoreError::NotFound(message),
        429 => StoreError::RateLimited { retry_after },
        408 | 500..=599 => StoreError::TransientIo(format!("{status}: {message}")),
        code => StoreError::Rejected {
            status: code,
            message,
        },
    }
}

#[async_trait]
impl AuthoritativeStore for RestStore {
    async fn fetch_medications(&self) -> Result<Vec<Medication>, StoreError> {
        let req = self.request(Method::GET, "medications/get-medications")?;
        let meds: Vec<Medication> = self.send_json(req).await?;
        Ok(meds.into_iter().map(Medication::normalize).collect())
    }

    async fn create_medication(&self, draft: &MedicationDraft) -> Result<Medication, StoreError> {
        let req = self.request(Method::POST, "medications/add")?.json(draft);
        self.send_json(req).await.map(Medication::normalize)
    }

    async fn update_medication(
        &self,
        id: MedicationId,
        draft: &MedicationDraft,
    ) -> Result<Medication, StoreError> {
        let req = self
            .request(Method::PUT, &format!("medications/update/{id}"))?
            .json(draft);
        self.send_json(req).await.map(Medication::normalize)
    }

    async fn delete_medication(&self, id: MedicationId) -> Result<(), StoreError> {
        let req = self.request(Method::DELETE, &format!("medications/delete/{id}"))?;
        self.send(req).await.map(|_| ())
    }

    async fn set_dose_status(&self, update: &DoseStatusUpdate) -> Result<Medication, StoreError> {
        let id = update.medication_id;
        let req = match update.status {
            DoseState::Taken | DoseState::Pending => {
                let taken = update.status == DoseState::Taken;
                self.request(Method::PUT, &format!("medications/{id}/taken"))?
                    .json(&json!({
                        "date": update.date,
                        "doseIndex": update.dose_index,
                        "taken": taken,
                        "takenAt": taken.then_some(update.at),
                    }))
            }
            DoseState::Missed => self
                .request(Method::PUT, &format!("medications/{id}/missed"))?
                .json(&json!({
                    "date": update.date,
                    "doseIndex": update.dose_index,
                    "missed": true,
                })),
        };
        self.send_json(req).await.map(Medication::normalize)
    }

    async fn fetch_reminders(&self) -> Result<Vec<Reminder>, StoreError> {
        let req = self.request(Method::GET, "reminders/get-reminders")?;
        let envelope: RemindersEnvelope = self.send_json(req).await?;
        Ok(envelope.reminders)
    }

    async fn create_reminder(&self, draft: &ReminderDraft) -> Result<Reminder, StoreError> {
        let req = self.request(Method::POST, "reminders/add")?.json(draft);
        let envelope: ReminderEnvelope = self.send_json(req).await?;
        Ok(envelope.reminder)
    }

    async fn update_reminder_status(
        &self,
        update: &ReminderStatusUpdate,
    ) -> Result<Reminder, StoreError> {
        let req = self
            .request(
                Method::PUT,
                &format!("reminders/update/{}/status", update.reminder_id),
            )?
            .json(&json!({ "status": update.status, "date": update.date }));
        let envelope: ReminderEnvelope = self.send_json(req).await?;
        Ok(envelope.reminder)
    }

    async fn delete_reminder(&self, id: ReminderId) -> Result<(), StoreError> {
        let req = self.request(Method::DELETE, &format!("reminders/delete/{id}"))?;
        self.send(req).await.map(|_| ())
    }
}

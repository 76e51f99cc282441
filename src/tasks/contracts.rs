//! Payload contracts shared with the sidecar workers. Each serializes to the
//! JSON body the worker receives.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TaskError;
use crate::db::{NewTask, TaskKind};
use crate::phone::is_e164;
use crate::twilio::messages::Channel;

/// Longest SMS body Twilio accepts.
const MAX_SMS_BODY: usize = 1600;

pub trait TaskContract: Serialize {
    const KIND: TaskKind;

    fn validate(&self) -> Result<(), TaskError>;

    fn idempotency_key(&self) -> &str;

    fn into_task(self) -> Result<NewTask, TaskError>
    where
        Self: Sized,
    {
        self.validate()?;
        if self.idempotency_key().trim().is_empty() {
            return Err(TaskError::Invalid("idempotencyKey is required".into()));
        }
        Ok(NewTask {
            kind: Self::KIND,
            payload: serde_json::to_value(&self)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTask {
    pub to: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Tenant slug, for the worker's logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    pub idempotency_key: String,
}

impl TaskContract for EmailTask {
    const KIND: TaskKind = TaskKind::SendEmail;

    fn validate(&self) -> Result<(), TaskError> {
        let to = self.to.trim();
        if to.is_empty() || !to.contains('@') {
            return Err(TaskError::Invalid(format!("bad email recipient {to:?}")));
        }
        if self.subject.trim().is_empty() {
            return Err(TaskError::Invalid("email subject is empty".into()));
        }
        if self.text.is_none() && self.html.is_none() {
            return Err(TaskError::Invalid("email needs text or html".into()));
        }
        Ok(())
    }

    fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsTask {
    pub to: String,
    pub body: String,
    #[serde(rename = "type", default)]
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub idempotency_key: String,
}

impl TaskContract for SmsTask {
    const KIND: TaskKind = TaskKind::SendSms;

    fn validate(&self) -> Result<(), TaskError> {
        let to = self.to.strip_prefix("whatsapp:").unwrap_or(&self.to);
        if !is_e164(to) {
            return Err(TaskError::Invalid("sms recipient is not E.164".into()));
        }
        if self.body.trim().is_empty() {
            return Err(TaskError::Invalid("sms body is empty".into()));
        }
        if self.body.chars().count() > MAX_SMS_BODY {
            return Err(TaskError::Invalid("sms body too long".into()));
        }
        Ok(())
    }

    fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhoneAction {
    /// Buy a number (a specific one, or the first match for an area code).
    Purchase,
    /// Give a number back to the carrier and release the assignment.
    Release,
    /// Attach a number already on the account.
    AssignExisting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneNumberTask {
    pub action: PhoneAction,
    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_code: Option<String>,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarding_number: Option<String>,
    pub idempotency_key: String,
}

fn default_country() -> String {
    "US".to_string()
}

impl TaskContract for PhoneNumberTask {
    const KIND: TaskKind = TaskKind::PhoneNumbers;

    fn validate(&self) -> Result<(), TaskError> {
        if let Some(number) = &self.phone_number {
            if !is_e164(number) {
                return Err(TaskError::Invalid("phoneNumber is not E.164".into()));
            }
        }
        if let Some(number) = &self.forwarding_number {
            if !is_e164(number) {
                return Err(TaskError::Invalid("forwardingNumber is not E.164".into()));
            }
        }
        match self.action {
            PhoneAction::Purchase if self.phone_number.is_none() && self.area_code.is_none() => Err(
                TaskError::Invalid("purchase needs phoneNumber or areaCode".into()),
            ),
            PhoneAction::Release | PhoneAction::AssignExisting if self.phone_number.is_none() => {
                Err(TaskError::Invalid("phoneNumber is required".into()))
            }
            _ => Ok(()),
        }
    }

    fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }
}

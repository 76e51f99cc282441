use serde::{Deserialize, Serialize};

use super::TwilioClient;
use crate::provider::{execute, ProviderError, Safety};

const PROVIDER: &str = "telephony";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableNumber {
    pub phone_number: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedNumber {
    pub sid: String,
    pub phone_number: String,
}

#[derive(Deserialize)]
struct AvailableList {
    #[serde(default)]
    available_phone_numbers: Vec<AvailableNumber>,
}

#[derive(Deserialize)]
struct OwnedList {
    #[serde(default)]
    incoming_phone_numbers: Vec<OwnedNumber>,
}

impl TwilioClient {
    /// Local numbers for sale in `country`, optionally within an area code.
    pub async fn search_available(
        &self,
        country: &str,
        area_code: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AvailableNumber>, ProviderError> {
        self.ensure_configured(PROVIDER)?;
        let resource = format!("AvailablePhoneNumbers/{country}/Local.json");
        let mut query = vec![("PageSize", limit.clamp(1, 50).to_string())];
        if let Some(code) = area_code {
            query.push(("AreaCode", code.to_string()));
        }
        let list: AvailableList =
            execute(PROVIDER, Safety::Read, || self.get(&resource).query(&query)).await?;
        Ok(list.available_phone_numbers)
    }

    /// Buy a number and point its voice URL at the voice provider. Purchases
    /// carry no idempotency key, so they are never retried here.
    pub async fn purchase(&self, phone_number: &str) -> Result<OwnedNumber, ProviderError> {
        self.ensure_configured(PROVIDER)?;
        let mut params = vec![("PhoneNumber", phone_number)];
        if !self.voice_url.is_empty() {
            params.push(("VoiceUrl", self.voice_url.as_str()));
        }
        let owned: OwnedNumber = execute(PROVIDER, Safety::Write, || {
            self.post("IncomingPhoneNumbers.json").form(&params)
        })
        .await?;
        tracing::info!(sid = %owned.sid, "Purchased phone number");
        Ok(owned)
    }

    /// Find a number already on the account.
    pub async fn find_owned(&self, phone_number: &str) -> Result<Option<OwnedNumber>, ProviderError> {
        self.ensure_configured(PROVIDER)?;
        let list: OwnedList = execute(PROVIDER, Safety::Read, || {
            self.get("IncomingPhoneNumbers.json")
                .query(&[("PhoneNumber", phone_number)])
        })
        .await?;
        Ok(list.incoming_phone_numbers.into_iter().next())
    }

    /// Release a number. Already gone counts as released.
    pub async fn release(&self, sid: &str) -> Result<(), ProviderError> {
        self.ensure_configured(PROVIDER)?;
        let resource = format!("IncomingPhoneNumbers/{sid}.json");
        match execute::<serde_json::Value, _>(PROVIDER, Safety::Write, || self.delete(&resource)).await {
            Ok(_) | Err(ProviderError::NotFound { .. }) => {
                tracing::info!(sid, "Released phone number");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

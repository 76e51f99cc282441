//! Twilio REST client: number provisioning (`numbers`) and SMS / WhatsApp
//! (`messages`). One account-wide key for every tenant.

pub mod messages;
pub mod numbers;

use std::time::Duration;

use reqwest::RequestBuilder;

use crate::config::TwilioConfig;
use crate::provider::ProviderError;

pub struct TwilioClient {
    client: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    messaging_from: String,
    whatsapp_from: String,
    voice_url: String,
}

impl TwilioClient {
    pub fn new(twilio_config: &TwilioConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()?,
            api_base: twilio_config.api_base.trim_end_matches('/').to_string(),
            account_sid: twilio_config.account_sid.clone(),
            auth_token: twilio_config.auth_token.clone(),
            messaging_from: twilio_config.messaging_from.clone(),
            whatsapp_from: twilio_config.whatsapp_from.clone(),
            voice_url: twilio_config.voice_url.clone(),
        })
    }

    fn url(&self, resource: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/{resource}",
            self.api_base, self.account_sid
        )
    }

    fn get(&self, resource: &str) -> RequestBuilder {
        self.client
            .get(self.url(resource))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
    }

    fn post(&self, resource: &str) -> RequestBuilder {
        self.client
            .post(self.url(resource))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
    }

    fn delete(&self, resource: &str) -> RequestBuilder {
        self.client
            .delete(self.url(resource))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
    }

    fn ensure_configured(&self, provider: &'static str) -> Result<(), ProviderError> {
        if self.account_sid.is_empty() || self.auth_token.is_empty() {
            return Err(ProviderError::invalid(provider, "Twilio credentials not configured"));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_client(api_base: &str) -> TwilioClient {
    TwilioClient::new(&TwilioConfig {
        api_base: api_base.to_string(),
        account_sid: "AC123".into(),
        auth_token: "secret".into(),
        messaging_from: "+15005550006".into(),
        whatsapp_from: "+14155238886".into(),
        voice_url: "https://voice.example/inbound".into(),
    })
    .unwrap()
}

//! Fixtures shared by the test modules: seeded entities, webhook signing and
//! a router wired to an in-memory store and mock providers.

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::MockServer;

use crate::config::{BookingConfig, Config, NotificationsConfig, RetellConfig, TwilioConfig};
use crate::db::memory::MemoryStore;
use crate::db::{
    Agent, AgentStatus, AssignmentStatus, AssignmentType, PhoneAssignment, Tenant, TenantStatus,
};
use crate::ingress::verify::{hash_token, AGENT_ID_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::{app, AppState};

pub fn tenant(n: u128) -> Tenant {
    Tenant {
        id: Uuid::from_u128(n),
        slug: format!("salon-{n}"),
        business_name: format!("Salon Number {n}"),
        timezone: "America/New_York".into(),
        status: TenantStatus::Active,
        trial_ends_at: None,
        booking_access_token: Some("sq_token_1".into()),
        booking_location_id: Some("LOC1".into()),
        auto_create_customers: true,
        notification_email: None,
    }
}

pub fn agent(tenant: &Tenant, external_id: &str, token: &str) -> Agent {
    Agent {
        id: Uuid::new_v4(),
        tenant_id: tenant.id,
        external_agent_id: external_id.into(),
        bearer_token_hash: hash_token(token),
        status: AgentStatus::Active,
        voice_profile: None,
    }
}

pub fn assignment(tenant: &Tenant, number: &str) -> PhoneAssignment {
    PhoneAssignment {
        id: Uuid::new_v4(),
        tenant_id: tenant.id,
        agent_id: None,
        external_phone_id: None,
        phone_number: number.into(),
        status: AssignmentStatus::Active,
        forwarding_number: None,
        assignment_type: AssignmentType::Existing,
        metadata: json!({}),
    }
}

/// Hex HMAC-SHA256 over `"<ts>.<body>"`, the way Retell signs webhooks.
pub fn sign(secret: &[u8], ts: i64, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
    mac.update(ts.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub booking: MockServer,
    pub twilio: MockServer,
    pub tenant: Tenant,
    pub agent: Agent,
    pub state: AppState,
}

impl TestApp {
    pub const AGENT_ID: &'static str = "agent_ext";
    pub const TOOL_TOKEN: &'static str = "tool-token-1";
    pub const RETELL_KEY: &'static str = "key_retell_test";
    pub const WORKER_TOKEN: &'static str = "worker-token";
    pub const ADMIN_TOKEN: &'static str = "admin-token";

    pub async fn new() -> Self {
        let booking = MockServer::start().await;
        let twilio = MockServer::start().await;

        let mut config = Config {
            retell: RetellConfig {
                api_key: Self::RETELL_KEY.into(),
                signature_skew_secs: 300,
            },
            booking: BookingConfig {
                api_base: booking.uri(),
                api_version: "2024-10-17".into(),
            },
            twilio: TwilioConfig {
                api_base: twilio.uri(),
                account_sid: "AC123".into(),
                auth_token: "secret".into(),
                messaging_from: "+15005550006".into(),
                whatsapp_from: "+14155238886".into(),
                voice_url: "https://voice.example/inbound".into(),
            },
            notifications: NotificationsConfig {
                sms_confirmations: true,
                email_from: Some("frontdesk@receptionist.test".into()),
            },
            ..Config::default()
        };
        config.workers.token = Self::WORKER_TOKEN.into();
        config.admin.token = Self::ADMIN_TOKEN.into();

        let store = Arc::new(MemoryStore::new());
        let tenant = tenant(1);
        let agent = agent(&tenant, Self::AGENT_ID, Self::TOOL_TOKEN);
        store.insert_tenant(tenant.clone());
        store.insert_agent(agent.clone());

        let state = AppState::new(config, store.clone()).unwrap();
        Self {
            store,
            booking,
            twilio,
            tenant,
            agent,
            state,
        }
    }

    pub fn retell_key(&self) -> &'static [u8] {
        Self::RETELL_KEY.as_bytes()
    }

    pub async fn send_raw(&self, req: Request<Body>) -> Response {
        app(self.state.clone()).oneshot(req).await.unwrap()
    }

    /// Send a request and decode the JSON body (`Null` when empty).
    pub async fn send(&self, req: Request<Body>) -> (u16, Value) {
        let (status, bytes) = self.send_bytes(req).await;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    async fn send_bytes(&self, req: Request<Body>) -> (u16, Vec<u8>) {
        let resp = self.send_raw(req).await;
        let status = resp.status().as_u16();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn tool_request(&self, name: &str, body: &Value) -> Request<Body> {
        Request::post(format!("/api/tools/{name}"))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", Self::TOOL_TOKEN))
            .header(AGENT_ID_HEADER, Self::AGENT_ID)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Call a tool as the seeded agent.
    pub async fn tool(&self, name: &str, body: &Value) -> (u16, Value) {
        self.send(self.tool_request(name, body)).await
    }

    /// Like `tool`, but returns the body bytes untouched.
    pub async fn tool_raw(&self, name: &str, body: &Value) -> (u16, Vec<u8>) {
        self.send_bytes(self.tool_request(name, body)).await
    }

    /// Deliver a webhook signed with the configured key at the current time.
    pub async fn webhook(&self, route: &str, body: &Value) -> (u16, Value) {
        let bytes = serde_json::to_vec(body).unwrap();
        let ts = chrono::Utc::now().timestamp();
        let req = Request::post(format!("/api/webhooks/retell/{route}"))
            .header("content-type", "application/json")
            .header(TIMESTAMP_HEADER, ts.to_string())
            .header(SIGNATURE_HEADER, sign(self.retell_key(), ts, &bytes))
            .body(Body::from(bytes))
            .unwrap();
        self.send(req).await
    }

    pub async fn post_json(&self, uri: &str, token: Option<&str>, body: &Value) -> (u16, Value) {
        let mut req = Request::post(uri).header("content-type", "application/json");
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        self.send(req.body(Body::from(body.to_string())).unwrap()).await
    }

    /// Call an in-process worker route with the worker token.
    pub async fn worker(&self, name: &str, body: &Value) -> (u16, Value) {
        self.post_json(&format!("/api/workers/{name}"), Some(Self::WORKER_TOKEN), body)
            .await
    }
}

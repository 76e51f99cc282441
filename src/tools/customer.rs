use axum::extract::State;
use serde::Deserialize;
use serde_json::json;

use super::idempotency;
use super::{run, ToolCall, ToolReply};
use crate::error::ApiError;
use crate::phone::{redact, require_e164};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupCustomer {
    #[serde(alias = "customerPhone")]
    phone: String,
    #[serde(default)]
    customer_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentifyCaller {
    #[serde(default, alias = "customerPhone")]
    phone: Option<String>,
}

/// POST /api/tools/lookup-customer
///
/// Finds the customer by phone. Tenants with `auto_create_customers` get a
/// new profile on a miss.
pub async fn lookup_customer(
    State(state): State<AppState>,
    call: ToolCall,
) -> Result<ToolReply, ApiError> {
    let args: LookupCustomer = call.args()?;
    let phone = require_e164("phone", &args.phone)?;
    // `name` is an envelope key, so a caller's name sent under it arrives
    // through the metadata.
    let name = args
        .customer_name
        .or_else(|| call.metadata.argument("name").map(str::to_string))
        .filter(|n| !n.trim().is_empty());
    let tenant = &call.tenant.tenant;

    run("lookup-customer", |budget| async move {
        let found = budget
            .call("find_customer", state.booking.find_customer_by_phone(tenant, &phone))
            .await?;
        if let Some(customer) = found {
            return Ok(ToolReply::Fresh(json!({
                "found": true,
                "created": false,
                "customer": customer,
            })));
        }
        if !tenant.auto_create_customers {
            return Ok(ToolReply::Fresh(json!({ "found": false, "created": false })));
        }

        let key = idempotency::key(tenant.id, "create-customer", &[&phone]);
        let customer = budget
            .call(
                "create_customer",
                state
                    .booking
                    .create_customer(tenant, &phone, name.as_deref(), &key),
            )
            .await?;
        tracing::info!(phone = %redact(&phone), "Created customer on lookup miss");
        Ok(ToolReply::Fresh(json!({
            "found": false,
            "created": true,
            "customer": customer,
        })))
    })
    .await
}

/// POST /api/tools/identify-caller
pub async fn identify_caller(
    State(state): State<AppState>,
    call: ToolCall,
) -> Result<ToolReply, ApiError> {
    let args: IdentifyCaller = call.args()?;
    let raw = args
        .phone
        .as_deref()
        .or_else(|| call.metadata.from_number())
        .ok_or_else(|| ApiError::missing_field("phone"))?;
    let phone = require_e164("phone", raw)?;
    let tenant = &call.tenant.tenant;

    run("identify-caller", |budget| async move {
        let found = budget
            .call("find_customer", state.booking.find_customer_by_phone(tenant, &phone))
            .await?;
        let reply = match found {
            Some(customer) => json!({
                "known": true,
                "name": customer.display_name(),
                "customer": customer,
                "businessName": tenant.business_name,
            }),
            None => json!({
                "known": false,
                "businessName": tenant.business_name,
            }),
        };
        Ok(ToolReply::Fresh(reply))
    })
    .await
}

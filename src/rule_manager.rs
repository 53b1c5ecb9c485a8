//! Rule/filter management operations on a subscription (§4.8, §6):
//! `add_rule`, `remove_rule`, `get_rules`, carried over the same
//! `ManagementLink` a `Receiver` uses, with `com.microsoft:add-rule` /
//! `remove-rule` / `enumerate-rules` as the operation names. `RuleSet`
//! (`model::rule`) stays a thin in-memory mirror for callers who want to
//! validate before issuing a call; this is the component that actually
//! talks to the broker.

use std::sync::Arc;

use serde_json::json;

use crate::error::{from_status_code, Result, ServiceBusError, ServiceBusErrorKind};
use crate::link::{operations, ManagementBody, ManagementLink, ManagementResponse};
use crate::model::rule::wire;
use crate::model::RuleDescription;
use crate::retry::{self, RetryPolicy, ServerBusyLatch};

pub struct RuleManager {
    management: Arc<dyn ManagementLink>,
    retry_policy: Arc<dyn RetryPolicy>,
    busy_latch: ServerBusyLatch,
}

impl RuleManager {
    pub fn new(
        management: Arc<dyn ManagementLink>,
        retry_policy: Arc<dyn RetryPolicy>,
        busy_latch: ServerBusyLatch,
    ) -> Self {
        Self {
            management,
            retry_policy,
            busy_latch,
        }
    }

    async fn call_management(&self, operation: &'static str, body: ManagementBody) -> Result<ManagementResponse> {
        retry::call_management(
            self.management.as_ref(),
            self.retry_policy.as_ref(),
            &self.busy_latch,
            operation,
            body,
        )
        .await
    }

    pub async fn add_rule(&self, rule: &RuleDescription) -> Result<()> {
        let body = ManagementBody::Json(json!({
            "rule-description": wire::encode_rule_description(rule),
        }));
        let response = self.call_management(operations::ADD_RULE, body).await?;
        match response.status {
            200 | 204 => Ok(()),
            status => Err(from_status_code(status, "add-rule failed")),
        }
    }

    pub async fn remove_rule(&self, name: &str) -> Result<()> {
        let body = ManagementBody::Json(json!({ "rule-name": name }));
        let response = self.call_management(operations::REMOVE_RULE, body).await?;
        match response.status {
            200 | 204 => Ok(()),
            status => Err(from_status_code(status, "remove-rule failed")),
        }
    }

    pub async fn get_rules(&self) -> Result<Vec<RuleDescription>> {
        let body = ManagementBody::Json(json!({ "skip": 0, "top": 100 }));
        let response = self.call_management(operations::ENUMERATE_RULES, body).await?;
        Self::rules_from_response(response)
    }

    fn rules_from_response(response: ManagementResponse) -> Result<Vec<RuleDescription>> {
        match response.status {
            200 => match response.body {
                ManagementBody::Json(value) => {
                    let entries = value
                        .get("rules")
                        .and_then(|v| v.as_array())
                        .ok_or_else(|| {
                            ServiceBusError::new(
                                ServiceBusErrorKind::InternalError,
                                "enumerate-rules response missing rules array",
                            )
                        })?;
                    entries.iter().map(wire::decode_rule_description).collect()
                }
                ManagementBody::Empty => Ok(Vec::new()),
            },
            204 => Ok(Vec::new()),
            status => Err(from_status_code(status, "enumerate-rules failed")),
        }
    }
}

//! Credit ledger backed by PostgREST (Supabase)
//!
//! Deduction goes through a single database function so the decrement is
//! atomic on the database side; this client never does read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::SupabaseConfig;
use crate::credits::{next_month_start, CreditBalance, CreditLedger, DeductOutcome};
use crate::error::{AppError, Result};

pub struct RpcCreditLedger {
    client: Client,
    base_url: String,
    service_key: String,
    credits_table: String,
    deduct_function: String,
}

#[derive(Debug, Deserialize)]
struct CreditRow {
    user_id: String,
    available_credits: u32,
    used_credits: u32,
    total_credits: u32,
    #[serde(default)]
    reset_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct DeductParams<'a> {
    p_user_id: &'a str,
    p_amount: u32,
}

/// PostgREST returns a composite as an object, a set as an array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DeductResponse {
    One(DeductOutcome),
    Many(Vec<DeductOutcome>),
}

impl RpcCreditLedger {
    pub fn new(config: &SupabaseConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            credits_table: config.credits_table.clone(),
            deduct_function: config.deduct_function.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, path))
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }
}

#[async_trait]
impl CreditLedger for RpcCreditLedger {
    async fn balance(&self, user_id: &str) -> Result<CreditBalance> {
        let response = self
            .request(reqwest::Method::GET, &self.credits_table)
            .query(&[
                ("user_id", format!("eq.{}", user_id)),
                (
                    "select",
                    "user_id,available_credits,used_credits,total_credits,reset_date".to_string(),
                ),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Persistence(format!(
                "Credit balance lookup failed with {}: {}",
                status, body
            )));
        }

        let row = response
            .json::<Vec<CreditRow>>()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("No credit account for user {}", user_id)))?;

        Ok(CreditBalance {
            reset_at: row.reset_date.unwrap_or_else(|| next_month_start(Utc::now())),
            user_id: row.user_id,
            available: row.available_credits,
            used: row.used_credits,
            total: row.total_credits,
        })
    }

    async fn deduct(&self, user_id: &str, amount: u32) -> Result<DeductOutcome> {
        let response = self
            .request(reqwest::Method::POST, &format!("rpc/{}", self.deduct_function))
            .json(&DeductParams {
                p_user_id: user_id,
                p_amount: amount,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(user_id, amount, status = %status, "Credit deduction RPC failed");
            return Err(AppError::Persistence(format!(
                "Credit deduction failed with {}: {}",
                status, body
            )));
        }

        let outcome = match response.json::<DeductResponse>().await? {
            DeductResponse::One(outcome) => outcome,
            DeductResponse::Many(rows) => rows.into_iter().next().ok_or_else(|| {
                AppError::Persistence("Credit deduction returned no rows".to_string())
            })?,
        };

        info!(user_id, amount, success = outcome.success, remaining = outcome.remaining, "Credit deduction");
        Ok(outcome)
    }
}

//! Payment gateway integration and subscription reconciliation.
//!
//! Outbound: a hosted-checkout token request signed with HMAC-SHA256 over
//! the gateway's exact field concatenation. Inbound: the asynchronous
//! callback, verified in constant time, then reconciled idempotently — the
//! `merchant_oid` is the idempotency key, and a payment already in a
//! terminal state acknowledges without side effects so the gateway stops
//! retrying.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{Datelike, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use berth_config::Settings;
use berth_types::{
    Company, CoreError, CoreResult, Currency, Invoice, InvoiceStatus, Payment, PaymentStatus,
    PlanTier, Subscription, SubscriptionStatus,
};

use crate::repo::{
    CompanyRepo, InvoiceRepo, PaymentRepo, Store, SubscriptionRepo, WorkspaceRepo,
};
use crate::secret;

type HmacSha256 = Hmac<Sha256>;

/// Days added to the subscription period per successful payment.
const PERIOD_DAYS: i64 = 30;

/// OS-side storage enlargement, implemented by the provisioner. Billing
/// calls it after a plan upgrade; a deployment without one still gets the
/// database rows updated.
pub trait StorageUpgrader {
    fn upgrade_storage(&self, workspace_id: i64, new_quota_gb: u32) -> CoreResult<()>;
}

/// A successfully initiated hosted-payment session.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutSession {
    pub iframe_url: String,
    pub token: String,
    pub payment_id: i64,
    pub merchant_oid: String,
}

/// The gateway's callback POST body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackForm {
    pub merchant_oid: String,
    pub status: String,
    pub total_amount: String,
    pub hash: String,
    #[serde(default)]
    pub failed_reason_code: Option<String>,
    #[serde(default)]
    pub failed_reason_msg: Option<String>,
    #[serde(default)]
    pub test_mode: Option<String>,
    #[serde(default)]
    pub payment_type: Option<String>,
}

/// How the HTTP layer must answer the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackDisposition {
    /// Respond `OK` with 200 — processed, or already terminal.
    Accepted,
    /// Respond 400; nothing was mutated.
    InvalidSignature,
    /// Respond 404; no payment carries this merchant_oid.
    UnknownPayment,
}

pub struct BillingService<'a> {
    store: &'a dyn Store,
    settings: &'a Settings,
    upgrader: Option<&'a dyn StorageUpgrader>,
}

impl<'a> BillingService<'a> {
    pub fn new(store: &'a dyn Store, settings: &'a Settings) -> Self {
        Self {
            store,
            settings,
            upgrader: None,
        }
    }

    pub fn with_storage_upgrader(mut self, upgrader: &'a dyn StorageUpgrader) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    /// Initiates a hosted-payment session: creates the pending `Payment`
    /// row, signs the token request, and asks the gateway for an iframe
    /// token.
    pub fn start_checkout(
        &self,
        company_id: i64,
        plan: PlanTier,
        currency: Currency,
        user_ip: &str,
        user_email: &str,
    ) -> CoreResult<CheckoutSession> {
        if !self.settings.gateway.is_configured() {
            return Err(CoreError::invalid_input("payment gateway is not configured"));
        }
        if !self.settings.supported_currencies.contains(&currency) {
            return Err(CoreError::invalid_input(format!(
                "unsupported currency: {}",
                currency.as_str()
            )));
        }
        let plan_spec = self.settings.plans.get(plan);
        let amount = self
            .settings
            .plans
            .price(plan, currency)
            .ok_or_else(|| {
                CoreError::invalid_input(format!(
                    "no {} price configured for plan {}",
                    currency.as_str(),
                    plan.as_str()
                ))
            })?;

        let company = self.store.company(company_id)?;
        let subscription = self.store.subscription_of_company(company_id)?;
        let now = Utc::now();
        let merchant_oid = secret::merchant_oid(company_id, now);

        let payment = self.store.insert_payment(Payment {
            id: 0,
            company_id,
            subscription_id: subscription.map(|s| s.id),
            merchant_oid: merchant_oid.clone(),
            amount,
            currency,
            plan,
            status: PaymentStatus::Pending,
            payment_type: "initial".to_string(),
            failure_reason_code: None,
            failure_reason_message: None,
            test_mode: self.settings.gateway.test_mode,
            user_ip: Some(user_ip.to_string()),
            created_at: now,
            completed_at: None,
        })?;
        info!(payment = payment.id, %merchant_oid, "created pending payment");

        let basket_items = json!([[plan_spec.name, format!("{:.2}", amount as f64 / 100.0), 1]]);
        let basket = BASE64.encode(basket_items.to_string());
        let token = self.checkout_token(&merchant_oid, user_ip, user_email, amount, &basket, currency);

        let form: BTreeMap<&str, String> = BTreeMap::from([
            ("merchant_id", self.settings.gateway.merchant_id.clone()),
            ("user_ip", user_ip.to_string()),
            ("merchant_oid", merchant_oid.clone()),
            ("email", user_email.to_string()),
            ("payment_amount", amount.to_string()),
            ("paytr_token", token),
            ("user_basket", basket),
            ("no_installment", "0".to_string()),
            ("max_installment", "0".to_string()),
            ("user_name", company.name.clone()),
            ("merchant_ok_url", format!("{}/billing/payment/success", self.settings.base_url)),
            ("merchant_fail_url", format!("{}/billing/payment/fail", self.settings.base_url)),
            ("merchant_oid_url", format!("{}/billing/callback", self.settings.base_url)),
            ("timeout_limit", self.settings.gateway.timeout_limit.to_string()),
            ("currency", currency.as_str().to_string()),
            ("test_mode", gateway_flag(self.settings.gateway.test_mode)),
            ("lang", "en".to_string()),
        ]);

        match self.request_iframe_token(&form) {
            Ok(iframe_token) => {
                let iframe_url = self
                    .settings
                    .gateway
                    .iframe_url
                    .replace("{token}", &iframe_token);
                Ok(CheckoutSession {
                    iframe_url,
                    token: iframe_token,
                    payment_id: payment.id,
                    merchant_oid,
                })
            }
            Err(err) => {
                let mut failed = payment;
                failed.status = PaymentStatus::Failed;
                failed.failure_reason_message = Some(err.to_string());
                self.store.update_payment(&failed)?;
                Err(CoreError::Other(anyhow::anyhow!(
                    "payment gateway rejected token request: {err}"
                )))
            }
        }
    }

    /// Token signature: base64 of HMAC-SHA256 over the concatenation of
    /// merchant_id, user_ip, merchant_oid, email, amount, basket, the two
    /// installment zeros, currency, test_mode, and the salt, in the
    /// gateway's exact field order.
    fn checkout_token(
        &self,
        merchant_oid: &str,
        user_ip: &str,
        email: &str,
        amount: i64,
        basket: &str,
        currency: Currency,
    ) -> String {
        let gw = &self.settings.gateway;
        let message = format!(
            "{}{}{}{}{}{}00{}{}{}",
            gw.merchant_id,
            user_ip,
            merchant_oid,
            email,
            amount,
            basket,
            currency.as_str(),
            gateway_flag(gw.test_mode),
            gw.merchant_salt,
        );
        sign(&gw.merchant_key, &message)
    }

    fn request_iframe_token(&self, form: &BTreeMap<&str, String>) -> anyhow::Result<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            status: String,
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            reason: Option<String>,
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        let response: TokenResponse = client
            .post(&self.settings.gateway.token_url)
            .form(form)
            .send()?
            .error_for_status()?
            .json()?;

        if response.status == "success" {
            response
                .token
                .ok_or_else(|| anyhow::anyhow!("gateway returned success without a token"))
        } else {
            anyhow::bail!(
                "{}",
                response.reason.unwrap_or_else(|| "unknown gateway error".to_string())
            )
        }
    }

    /// Constant-time verification of the callback signature: HMAC-SHA256
    /// over `merchant_oid + salt + status + total_amount`.
    pub fn verify_callback_signature(&self, form: &CallbackForm) -> bool {
        let gw = &self.settings.gateway;
        let message = format!(
            "{}{}{}{}",
            form.merchant_oid, gw.merchant_salt, form.status, form.total_amount
        );
        let Ok(received) = BASE64.decode(&form.hash) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(gw.merchant_key.as_bytes()) else {
            return false;
        };
        mac.update(message.as_bytes());
        mac.verify_slice(&received).is_ok()
    }

    /// Processes one gateway callback. Replays are safe: a terminal payment
    /// acknowledges without touching state.
    pub fn process_callback(&self, form: &CallbackForm) -> CoreResult<CallbackDisposition> {
        if !self.verify_callback_signature(form) {
            warn!(merchant_oid = %form.merchant_oid, "callback hash verification failed");
            return Ok(CallbackDisposition::InvalidSignature);
        }

        let Some(mut payment) = self.store.payment_by_merchant_oid(&form.merchant_oid)? else {
            warn!(merchant_oid = %form.merchant_oid, "callback for unknown payment");
            return Ok(CallbackDisposition::UnknownPayment);
        };

        if payment.status.is_terminal() {
            info!(
                payment = payment.id,
                status = ?payment.status,
                "replayed callback for terminal payment, acknowledging"
            );
            return Ok(CallbackDisposition::Accepted);
        }

        if form.status == "success" {
            self.apply_successful_payment(&mut payment, form)?;
        } else {
            payment.status = PaymentStatus::Failed;
            payment.failure_reason_code = form.failed_reason_code.clone();
            payment.failure_reason_message = form.failed_reason_msg.clone();
            self.store.update_payment(&payment)?;
            warn!(
                payment = payment.id,
                reason = form.failed_reason_msg.as_deref().unwrap_or("unknown"),
                "payment failed"
            );
        }

        // The gateway gets an acknowledgement either way, or it retries the
        // callback indefinitely.
        Ok(CallbackDisposition::Accepted)
    }

    fn apply_successful_payment(
        &self,
        payment: &mut Payment,
        form: &CallbackForm,
    ) -> CoreResult<()> {
        let now = Utc::now();
        payment.status = PaymentStatus::Success;
        payment.completed_at = Some(now);
        if let Some(kind) = &form.payment_type {
            payment.payment_type = kind.clone();
        }

        let mut company = self.store.company(payment.company_id)?;
        let plan_spec = self.settings.plans.get(payment.plan);

        let subscription = match self.store.subscription_of_company(company.id)? {
            None => self.store.insert_subscription(Subscription {
                id: 0,
                company_id: company.id,
                plan: payment.plan,
                status: SubscriptionStatus::Active,
                trial_starts_at: None,
                trial_ends_at: None,
                current_period_start: Some(now),
                current_period_end: Some(now + chrono::Duration::days(PERIOD_DAYS)),
                cancel_at_period_end: false,
                cancelled_at: None,
            })?,
            Some(mut sub) => {
                if sub.status == SubscriptionStatus::Trial {
                    // First payment after trial: fresh period.
                    sub.status = SubscriptionStatus::Active;
                    sub.plan = payment.plan;
                    sub.current_period_start = Some(now);
                    sub.current_period_end = Some(now + chrono::Duration::days(PERIOD_DAYS));
                } else {
                    if sub.plan != payment.plan {
                        info!(
                            company = company.id,
                            from = sub.plan.as_str(),
                            to = payment.plan.as_str(),
                            "plan change on renewal"
                        );
                        sub.plan = payment.plan;
                    }
                    sub.status = SubscriptionStatus::Active;
                    let previous_end = sub.current_period_end.unwrap_or(now);
                    sub.current_period_start = Some(previous_end);
                    sub.current_period_end =
                        Some(previous_end + chrono::Duration::days(PERIOD_DAYS));
                }
                self.store.update_subscription(&sub)?;
                sub
            }
        };

        company.plan = payment.plan;
        company.max_workspaces = plan_spec.max_workspaces;
        self.store.update_company(&company)?;

        self.upgrade_company_storage(&company, plan_spec.storage_per_workspace_gb)?;

        payment.subscription_id = Some(subscription.id);
        self.store.update_payment(payment)?;

        let year = now.year();
        let seq = self.store.next_invoice_seq(year)?;
        let invoice = self.store.insert_invoice(Invoice {
            id: 0,
            company_id: company.id,
            payment_id: payment.id,
            invoice_number: Invoice::format_number(year, seq),
            subtotal: payment.amount,
            tax_amount: 0,
            total_amount: payment.amount,
            currency: payment.currency,
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            invoice_date: now,
            due_date: now,
            paid_at: Some(now),
            status: InvoiceStatus::Paid,
            description: format!("{} Plan - Monthly Subscription", plan_spec.name),
        })?;

        info!(
            company = company.id,
            payment = payment.id,
            invoice = %invoice.invoice_number,
            plan = payment.plan.as_str(),
            "subscription activated"
        );
        Ok(())
    }

    /// Raises per-workspace storage to the plan's allowance. Never lowers.
    fn upgrade_company_storage(&self, company: &Company, plan_storage_gb: u32) -> CoreResult<()> {
        for workspace in self.store.workspaces_of_company(company.id)? {
            if workspace.disk_quota_gb >= plan_storage_gb {
                continue;
            }
            match self.upgrader {
                Some(upgrader) => {
                    if let Err(err) = upgrader.upgrade_storage(workspace.id, plan_storage_gb) {
                        warn!(workspace = workspace.id, %err, "storage upgrade failed");
                    }
                }
                None => {
                    let mut ws = workspace;
                    ws.disk_quota_gb = plan_storage_gb;
                    self.store.update_workspace(&ws)?;
                }
            }
        }
        Ok(())
    }

    /// Trial subscription for a new company; sets the company's plan limits
    /// immediately.
    pub fn create_trial(&self, company_id: i64, plan: PlanTier) -> CoreResult<Subscription> {
        if self.store.subscription_of_company(company_id)?.is_some() {
            return Err(CoreError::InvalidStateTransition(format!(
                "company {company_id} already has a subscription"
            )));
        }
        let plan_spec = self.settings.plans.get(plan);
        let now = Utc::now();

        let subscription = self.store.insert_subscription(Subscription {
            id: 0,
            company_id,
            plan,
            status: SubscriptionStatus::Trial,
            trial_starts_at: Some(now),
            trial_ends_at: Some(now + chrono::Duration::days(self.settings.trial_days as i64)),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            cancelled_at: None,
        })?;

        let mut company = self.store.company(company_id)?;
        company.plan = plan;
        company.max_workspaces = plan_spec.max_workspaces;
        self.store.update_company(&company)?;

        info!(company = company_id, plan = plan.as_str(), "trial subscription created");
        Ok(subscription)
    }

    /// Cancels immediately or flags cancellation at period end.
    pub fn cancel_subscription(
        &self,
        company_id: i64,
        immediate: bool,
    ) -> CoreResult<Subscription> {
        let mut subscription = self
            .store
            .subscription_of_company(company_id)?
            .ok_or_else(|| CoreError::not_found(format!("subscription for company {company_id}")))?;

        let now = Utc::now();
        if immediate {
            subscription.status = SubscriptionStatus::Cancelled;
        } else {
            subscription.cancel_at_period_end = true;
        }
        subscription.cancelled_at = Some(now);
        self.store.update_subscription(&subscription)?;
        info!(company = company_id, immediate, "subscription cancellation recorded");
        Ok(subscription)
    }
}

fn gateway_flag(flag: bool) -> String {
    if flag { "1" } else { "0" }.to_string()
}

fn sign(key: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Builds a valid callback signature; public for tests and for the sandbox
/// tooling that simulates gateway callbacks.
pub fn callback_signature(settings: &Settings, merchant_oid: &str, status: &str, total_amount: &str) -> String {
    let gw = &settings.gateway;
    sign(
        &gw.merchant_key,
        &format!("{}{}{}{}", merchant_oid, gw.merchant_salt, status, total_amount),
    )
}

//! Subscription & access gate.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::warn;

use crate::{
    config::Config,
    domain::UserId,
    messaging::types::Invoice,
    store::{kv_price_key, AccountStore, KV_PAID_MODE},
    Result,
};

pub const PAYLOAD_PREFIX: &str = "sub:";

/// Fixed-duration subscription plans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Plan {
    Days7,
    Days14,
    Days30,
}

impl Plan {
    pub const ALL: [Plan; 3] = [Plan::Days7, Plan::Days14, Plan::Days30];

    pub fn key(self) -> &'static str {
        match self {
            Plan::Days7 => "7d",
            Plan::Days14 => "14d",
            Plan::Days30 => "30d",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "7d" => Some(Plan::Days7),
            "14d" => Some(Plan::Days14),
            "30d" => Some(Plan::Days30),
            _ => None,
        }
    }

    /// Keys accepted by the admin price edit (`7`, `7d`, ...).
    fn parse_loose(key: &str) -> Option<Self> {
        match key {
            "7" | "7d" => Some(Plan::Days7),
            "14" | "14d" => Some(Plan::Days14),
            "30" | "30d" => Some(Plan::Days30),
            _ => None,
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            Plan::Days7 => 7 * 86_400,
            Plan::Days14 => 14 * 86_400,
            Plan::Days30 => 30 * 86_400,
        }
    }

    pub fn days(self) -> u32 {
        match self {
            Plan::Days7 => 7,
            Plan::Days14 => 14,
            Plan::Days30 => 30,
        }
    }

    pub fn description(self) -> String {
        format!("Доступ на {} дней", self.days())
    }
}

/// Parsed `sub:<plan>:<uid>` invoice payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PurchasePayload {
    pub plan: Plan,
    pub buyer: Option<UserId>,
}

impl PurchasePayload {
    pub fn encode(plan: Plan, buyer: UserId) -> String {
        format!("{PAYLOAD_PREFIX}{}:{}", plan.key(), buyer.0)
    }

    pub fn parse(payload: &str) -> Option<Self> {
        let rest = payload.trim().strip_prefix(PAYLOAD_PREFIX)?;
        let mut parts = rest.split(':');
        let plan = Plan::parse(parts.next()?)?;
        let buyer = parts.next().and_then(|s| s.parse::<i64>().ok()).map(UserId);
        Some(Self { plan, buyer })
    }
}

/// `max(paid_until, now) + secs`: renewing never loses remaining time.
pub fn extended_until(paid_until: i64, now: i64, secs: i64) -> i64 {
    paid_until.max(now) + secs
}

/// Parse an admin price message such as `7=15 14d:25, 30=45`.
///
/// Returns every recognised `(plan, price)` pair in input order, including
/// non-positive prices (the caller only stores positive ones).
pub fn parse_price_edit(text: &str) -> Vec<(Plan, i64)> {
    let Some(re) = price_token_re() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|c| {
            let plan = Plan::parse_loose(c.get(1)?.as_str())?;
            let price = c.get(2)?.as_str().parse::<i64>().ok()?;
            Some((plan, price))
        })
        .collect()
}

fn price_token_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[\s,])(\d+d?)\s*[=:]\s*(-?\d+)").ok())
        .as_ref()
}

/// Decides who may use the monitor.
///
/// Reads go through the account store; any store error denies access.
pub struct AccessGate {
    accounts: Arc<dyn AccountStore>,
    admin_id: UserId,
    currency: String,
    default_prices: [u32; 3],
}

impl AccessGate {
    pub fn new(accounts: Arc<dyn AccountStore>, cfg: &Config) -> Self {
        Self {
            accounts,
            admin_id: cfg.admin_id,
            currency: cfg.payment_currency.clone(),
            default_prices: [cfg.stars_price_7d, cfg.stars_price_14d, cfg.stars_price_30d],
        }
    }

    pub fn admin_id(&self) -> UserId {
        self.admin_id
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        user == self.admin_id
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    async fn paid_mode_strict(&self) -> Result<bool> {
        Ok(self
            .accounts
            .kv_get(KV_PAID_MODE)
            .await?
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false))
    }

    /// Current paid mode for display; read failures show as off.
    pub async fn paid_mode(&self) -> bool {
        match self.paid_mode_strict().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to read paid mode");
                false
            }
        }
    }

    pub async fn set_paid_mode(&self, enabled: bool) -> Result<()> {
        self.accounts
            .kv_set(KV_PAID_MODE, if enabled { "1" } else { "0" })
            .await
    }

    async fn access_strict(&self, user: UserId, now: i64) -> Result<bool> {
        if !self.paid_mode_strict().await? {
            return Ok(true);
        }
        if self.accounts.is_free_user(user).await? {
            return Ok(true);
        }
        Ok(self.accounts.paid_until(user).await? > now)
    }

    /// Admin, paid mode off, free user, or an unexpired subscription.
    pub async fn has_access(&self, user: UserId, now: i64) -> bool {
        if self.is_admin(user) {
            return true;
        }
        match self.access_strict(user, now).await {
            Ok(v) => v,
            Err(e) => {
                warn!(user_id = user.0, error = %e, "Access check failed; denying");
                false
            }
        }
    }

    /// Blocked and not the administrator. Lookup failures count as not blocked.
    pub async fn is_blocked_effective(&self, user: UserId) -> bool {
        if self.is_admin(user) {
            return false;
        }
        match self.accounts.get_user(user).await {
            Ok(u) => u.is_some_and(|u| u.blocked),
            Err(e) => {
                warn!(user_id = user.0, error = %e, "Failed to read blocked flag");
                false
            }
        }
    }

    /// Raw blocked flag (admin included), used on the admin user card.
    pub async fn is_blocked(&self, user: UserId) -> bool {
        matches!(self.accounts.get_user(user).await, Ok(Some(u)) if u.blocked)
    }

    /// Has this user started a private chat with the bot?
    pub async fn is_bot_user(&self, user: UserId) -> bool {
        match self.accounts.get_user(user).await {
            Ok(u) => u.is_some_and(|u| u.bot_user),
            Err(e) => {
                warn!(user_id = user.0, error = %e, "Failed to read bot_user flag");
                false
            }
        }
    }

    pub async fn is_free(&self, user: UserId) -> bool {
        self.accounts.is_free_user(user).await.unwrap_or(false)
    }

    /// Paid-until timestamp, 0 when unknown.
    pub async fn paid_until(&self, user: UserId) -> i64 {
        match self.accounts.paid_until(user).await {
            Ok(v) => v,
            Err(e) => {
                warn!(user_id = user.0, error = %e, "Failed to read subscription");
                0
            }
        }
    }

    /// Add `plan` to the user's subscription and return the new expiry.
    pub async fn extend(&self, user: UserId, plan: Plan, now: i64) -> Result<i64> {
        let current = self.accounts.paid_until(user).await?;
        let until = extended_until(current, now, plan.seconds());
        self.accounts.set_paid_until(user, until, now).await?;
        Ok(until)
    }

    /// Effective price: a positive override from settings, else the default.
    pub async fn price(&self, plan: Plan) -> i64 {
        let overridden = match self.accounts.kv_get(&kv_price_key(plan.key())).await {
            Ok(v) => v.and_then(|s| s.trim().parse::<i64>().ok()),
            Err(e) => {
                warn!(plan = plan.key(), error = %e, "Failed to read price override");
                None
            }
        };
        match overridden {
            Some(p) if p > 0 => p,
            _ => i64::from(self.default_prices[plan_index(plan)]),
        }
    }

    /// Price of an enabled plan; `None` when the effective price is not positive.
    pub async fn plan_price(&self, plan: Plan) -> Option<u32> {
        let p = self.price(plan).await;
        if p <= 0 {
            return None;
        }
        u32::try_from(p).ok()
    }

    /// Store the positive prices; returns how many were saved.
    pub async fn set_prices(&self, prices: &[(Plan, i64)]) -> Result<usize> {
        let mut saved = 0;
        for (plan, price) in prices {
            if *price > 0 {
                self.accounts
                    .kv_set(&kv_price_key(plan.key()), &price.to_string())
                    .await?;
                saved += 1;
            }
        }
        Ok(saved)
    }

    pub async fn invoice(&self, plan: Plan, buyer: UserId) -> Option<Invoice> {
        let amount = self.plan_price(plan).await?;
        Some(Invoice {
            title: "Доступ к бизнес-уведомлениям".to_string(),
            description: plan.description(),
            payload: PurchasePayload::encode(plan, buyer),
            currency: self.currency.clone(),
            label: plan.description(),
            amount,
        })
    }

    /// Pre-checkout validation: `Err` carries the rejection text.
    pub fn validate_checkout(
        &self,
        currency: Option<&str>,
        payload: &str,
    ) -> std::result::Result<(), &'static str> {
        if !payload.trim().starts_with(PAYLOAD_PREFIX) {
            return Err("Invalid payload");
        }
        match currency {
            Some(c) if !c.is_empty() && c != self.currency => Err("Unsupported currency"),
            _ => Ok(()),
        }
    }
}

fn plan_index(plan: Plan) -> usize {
    match plan {
        Plan::Days7 => 0,
        Plan::Days14 => 1,
        Plan::Days30 => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn gate() -> (Arc<MemoryStore>, AccessGate) {
        let store = Arc::new(MemoryStore::new());
        let cfg = Config::new("t", UserId(1));
        let gate = AccessGate::new(store.clone(), &cfg);
        (store, gate)
    }

    #[test]
    fn renewal_is_additive() {
        assert_eq!(extended_until(1_000, 500, 100), 1_100);
        assert_eq!(extended_until(200, 500, 100), 600);
        assert_eq!(extended_until(0, 500, 604_800), 605_300);
    }

    #[test]
    fn payload_parses_plan_and_buyer() {
        let p = PurchasePayload::parse("sub:14d:42").unwrap();
        assert_eq!(p.plan, Plan::Days14);
        assert_eq!(p.buyer, Some(UserId(42)));
        assert_eq!(PurchasePayload::encode(Plan::Days7, UserId(9)), "sub:7d:9");
        assert!(PurchasePayload::parse("sub:1y:1").is_none());
        assert!(PurchasePayload::parse("gift:7d:1").is_none());
    }

    #[test]
    fn price_edit_accepts_mixed_separators() {
        let v = parse_price_edit("7=15 14d:25, 30=45");
        assert_eq!(
            v,
            vec![(Plan::Days7, 15), (Plan::Days14, 25), (Plan::Days30, 45)]
        );
        assert!(parse_price_edit("cheaper please").is_empty());
        assert_eq!(parse_price_edit("7=0"), vec![(Plan::Days7, 0)]);
    }

    #[tokio::test]
    async fn paid_mode_gates_non_admins() {
        let (store, gate) = gate();
        assert!(gate.has_access(UserId(5), 100).await);

        gate.set_paid_mode(true).await.unwrap();
        assert!(!gate.has_access(UserId(5), 100).await);
        assert!(gate.has_access(UserId(1), 100).await);

        store.set_paid_until(UserId(5), 101, 0).await.unwrap();
        assert!(gate.has_access(UserId(5), 100).await);
        assert!(!gate.has_access(UserId(5), 101).await);

        store.set_free_user(UserId(6), true, 0).await.unwrap();
        assert!(gate.has_access(UserId(6), 100).await);
    }

    #[tokio::test]
    async fn store_errors_deny_access() {
        let (store, gate) = gate();
        store.set_unavailable(true);
        assert!(!gate.has_access(UserId(5), 100).await);
        assert!(gate.has_access(UserId(1), 100).await);
    }

    #[tokio::test]
    async fn extend_stacks_on_remaining_time() {
        let (_store, gate) = gate();
        let first = gate.extend(UserId(5), Plan::Days7, 1_000).await.unwrap();
        assert_eq!(first, 1_000 + 604_800);
        let second = gate.extend(UserId(5), Plan::Days7, 2_000).await.unwrap();
        assert_eq!(second, first + 604_800);
    }

    #[tokio::test]
    async fn price_override_and_disable() {
        let (store, gate) = gate();
        assert_eq!(gate.plan_price(Plan::Days7).await, Some(15));
        gate.set_prices(&[(Plan::Days7, 20), (Plan::Days14, 0)])
            .await
            .unwrap();
        assert_eq!(gate.plan_price(Plan::Days7).await, Some(20));
        assert_eq!(gate.plan_price(Plan::Days14).await, Some(25));

        store.kv_set("stars_price_30d", "-1").await.unwrap();
        assert_eq!(gate.plan_price(Plan::Days30).await, Some(45));

        let mut cfg = Config::new("t", UserId(1));
        cfg.stars_price_30d = 0;
        let gate = AccessGate::new(store, &cfg);
        assert_eq!(gate.plan_price(Plan::Days30).await, None);
        assert!(gate.invoice(Plan::Days30, UserId(2)).await.is_none());
    }

    #[test]
    fn checkout_validation() {
        let (_s, gate) = gate();
        assert_eq!(gate.validate_checkout(Some("XTR"), "sub:7d:1"), Ok(()));
        assert_eq!(gate.validate_checkout(None, "sub:7d:1"), Ok(()));
        assert_eq!(
            gate.validate_checkout(Some("USD"), "sub:7d:1"),
            Err("Unsupported currency")
        );
        assert_eq!(
            gate.validate_checkout(Some("XTR"), "x"),
            Err("Invalid payload")
        );
    }
}

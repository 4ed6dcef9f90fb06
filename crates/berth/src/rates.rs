//! Exchange-rate storage, conversion, and the daily feed fetcher.
//!
//! Rates are stored per `(source, target, effective_date)`; conversion picks
//! the latest rate at or before the requested date. The fetcher pulls a
//! daily JSON feed (`{"base": "...", "date": "...", "rates": {...}}`) and
//! upserts one row per supported target currency. Plan prices fall back to
//! the static catalog when no rate row exists.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::info;

use berth_config::Settings;
use berth_retry::{BackoffConfig, BackoffStrategy, run_with_backoff};
use berth_types::{CoreError, CoreResult, Currency, ExchangeRate, PlanTier};

use crate::repo::{RateRepo, Store};

pub struct RateService<'a> {
    store: &'a dyn Store,
    settings: &'a Settings,
}

impl<'a> RateService<'a> {
    pub fn new(store: &'a dyn Store, settings: &'a Settings) -> Self {
        Self { store, settings }
    }

    /// Converts minor units between currencies using the latest stored rate
    /// at or before `date`. Identity conversions always succeed.
    pub fn convert(
        &self,
        amount_minor: i64,
        from: Currency,
        to: Currency,
        date: NaiveDate,
    ) -> CoreResult<Option<i64>> {
        if from == to {
            return Ok(Some(amount_minor));
        }
        // A direct rate, or the inverse of the opposite pair.
        if let Some(rate) = self.store.rate_on_or_before(from, to, date)? {
            let converted =
                (amount_minor as i128 * rate.rate_micros as i128) / ExchangeRate::SCALE as i128;
            return Ok(Some(converted as i64));
        }
        if let Some(rate) = self.store.rate_on_or_before(to, from, date)? {
            if rate.rate_micros > 0 {
                let converted =
                    (amount_minor as i128 * ExchangeRate::SCALE as i128) / rate.rate_micros as i128;
                return Ok(Some(converted as i64));
            }
        }
        Ok(None)
    }

    /// Plan price in the requested currency: the catalog price when
    /// configured, otherwise a conversion from the default currency's
    /// catalog price.
    pub fn plan_price(
        &self,
        tier: PlanTier,
        currency: Currency,
        date: NaiveDate,
    ) -> CoreResult<Option<i64>> {
        if let Some(price) = self.settings.plans.price(tier, currency) {
            return Ok(Some(price));
        }
        let base_currency = self.settings.default_currency;
        match self.settings.plans.price(tier, base_currency) {
            Some(base_price) => self.convert(base_price, base_currency, currency, date),
            None => Ok(None),
        }
    }

    /// Fetches the daily feed and upserts one row per supported currency.
    /// Returns the number of rates stored.
    pub fn fetch_daily(&self) -> CoreResult<usize> {
        #[derive(Deserialize)]
        struct Feed {
            base: String,
            date: NaiveDate,
            rates: BTreeMap<String, f64>,
        }

        let backoff = BackoffConfig {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        };

        let url = self.settings.rates_feed_url.clone();
        let feed: Feed = run_with_backoff(&backoff, |attempt| {
            info!(%url, attempt, "fetching exchange rates");
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()?;
            let feed = client.get(&url).send()?.error_for_status()?.json::<Feed>()?;
            Ok::<_, anyhow::Error>(feed)
        })
        .map_err(|e| CoreError::Other(anyhow::anyhow!("rates feed unavailable: {e}")))?;

        let source = Currency::parse(&feed.base).ok_or_else(|| {
            CoreError::invalid_input(format!("unsupported feed base currency: {}", feed.base))
        })?;

        let mut stored = 0;
        for (code, rate) in feed.rates {
            let Some(target) = Currency::parse(&code) else {
                continue;
            };
            if target == source || !self.settings.supported_currencies.contains(&target) {
                continue;
            }
            self.store.upsert_rate(ExchangeRate {
                source_currency: source,
                target_currency: target,
                rate_micros: (rate * ExchangeRate::SCALE as f64).round() as i64,
                effective_date: feed.date,
            })?;
            stored += 1;
        }

        info!(stored, base = source.as_str(), date = %feed.date, "exchange rates updated");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use berth_types::Currency;

    use super::*;
    use crate::repo::{MemoryStore, RateRepo};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, d).unwrap()
    }

    fn store_with_rate(rate_micros: i64) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .upsert_rate(ExchangeRate {
                source_currency: Currency::Usd,
                target_currency: Currency::Try,
                rate_micros,
                effective_date: day(10),
            })
            .expect("upsert");
        store
    }

    #[test]
    fn identity_conversion_is_free() {
        let store = MemoryStore::new();
        let settings = Settings::default();
        let rates = RateService::new(&store, &settings);
        assert_eq!(
            rates.convert(2_900, Currency::Usd, Currency::Usd, day(1)).expect("convert"),
            Some(2_900)
        );
    }

    #[test]
    fn converts_with_direct_and_inverse_rates() {
        // 1 USD = 35.5 TRY
        let store = store_with_rate(35_500_000);
        let settings = Settings::default();
        let rates = RateService::new(&store, &settings);

        // $29.00 -> ₺1029.50
        assert_eq!(
            rates.convert(2_900, Currency::Usd, Currency::Try, day(15)).expect("convert"),
            Some(102_950)
        );
        // The inverse pair uses the reciprocal.
        assert_eq!(
            rates.convert(102_950, Currency::Try, Currency::Usd, day(15)).expect("convert"),
            Some(2_900)
        );
        // No rate known before the effective date.
        assert_eq!(
            rates.convert(2_900, Currency::Usd, Currency::Try, day(5)).expect("convert"),
            None
        );
    }

    #[test]
    fn plan_price_prefers_catalog() {
        let store = store_with_rate(35_500_000);
        let settings = Settings::default();
        let rates = RateService::new(&store, &settings);

        // USD is in the catalog; no conversion involved.
        assert_eq!(
            rates.plan_price(PlanTier::Team, Currency::Usd, day(15)).expect("price"),
            Some(9_900)
        );
    }

    #[test]
    fn fetch_daily_parses_feed_and_upserts() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("server");
        let addr = server.server_addr().to_string();
        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("request");
            let body = r#"{"amount":1.0,"base":"USD","date":"2026-07-30","rates":{"TRY":35.5,"EUR":0.91,"JPY":155.0}}"#;
            let response = tiny_http::Response::from_string(body).with_header(
                tiny_http::Header::from_bytes("Content-Type", "application/json").expect("header"),
            );
            request.respond(response).expect("respond");
        });

        let store = MemoryStore::new();
        let mut settings = Settings::default();
        settings.rates_feed_url = format!("http://{addr}");

        let rates = RateService::new(&store, &settings);
        // JPY is not a supported currency, so only TRY and EUR land.
        assert_eq!(rates.fetch_daily().expect("fetch"), 2);
        handle.join().expect("join");

        let row = store
            .rate_on_or_before(Currency::Usd, Currency::Try, day(31))
            .expect("query")
            .expect("row");
        assert_eq!(row.rate_micros, 35_500_000);
        assert_eq!(row.effective_date, NaiveDate::from_ymd_opt(2026, 7, 30).unwrap());
    }
}

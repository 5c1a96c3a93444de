//! Per-user and per-IP admission control.
//!
//! Agent creation passes through sliding windows (minute, hour, day, and an
//! hourly per-IP window) plus a monthly counter with calendar reset. Every
//! rejection carries structured detail so the caller can explain exactly
//! which limit was hit.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, Duration, Utc};
use tracing::{debug, info};

use ariana_store::UsageRepository;
use ariana_types::{CoreError, LimitType, QuotaDetail, UserId};

/// Window and counter limits for one resource class.
#[derive(Debug, Clone)]
pub struct QuotaLimits {
    /// Creations allowed per sliding minute.
    pub per_minute: u64,
    /// Creations allowed per sliding hour.
    pub per_hour: u64,
    /// Creations allowed per sliding day.
    pub per_day: u64,
    /// Creations allowed per calendar month.
    pub per_month: u64,
    /// Creations allowed per IP per sliding hour, across all users.
    pub per_ip_per_hour: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            per_minute: 3,
            per_hour: 10,
            per_day: 30,
            per_month: 100,
            per_ip_per_hour: 20,
        }
    }
}

/// Sliding-window + monthly-counter quota guard.
pub struct QuotaGuard {
    usage: Arc<dyn UsageRepository>,
    limits: QuotaLimits,
}

impl QuotaGuard {
    /// Guard over the usage repository with the given limits.
    pub fn new(usage: Arc<dyn UsageRepository>, limits: QuotaLimits) -> Self {
        Self { usage, limits }
    }

    /// Verify every window admits one more agent creation. Does not record
    /// anything; call [`record_agent_creation`](Self::record_agent_creation)
    /// once the creation is committed.
    pub async fn check_agent_creation(
        &self,
        user_id: &UserId,
        ip: IpAddr,
    ) -> Result<(), CoreError> {
        let now = Utc::now();

        let windows = [
            (LimitType::Minute, Duration::minutes(1), self.limits.per_minute),
            (LimitType::Hour, Duration::hours(1), self.limits.per_hour),
            (LimitType::Day, Duration::days(1), self.limits.per_day),
        ];
        for (limit_type, window, max) in windows {
            let current = self
                .usage
                .count_creations_since(user_id, now - window)
                .await
                .map_err(internal)?;
            if current >= max {
                debug!(%user_id, ?limit_type, current, max, "agent creation denied");
                return Err(quota_error(limit_type, current, max, false));
            }
        }

        let ip_current = self
            .usage
            .count_ip_creations_since(ip, now - Duration::hours(1))
            .await
            .map_err(internal)?;
        if ip_current >= self.limits.per_ip_per_hour {
            debug!(%ip, ip_current, "agent creation denied by IP window");
            return Err(quota_error(
                LimitType::Ip,
                ip_current,
                self.limits.per_ip_per_hour,
                false,
            ));
        }

        let monthly = self.monthly_count(user_id).await.map_err(internal)?;
        if monthly >= self.limits.per_month {
            return Err(quota_error(
                LimitType::Month,
                monthly,
                self.limits.per_month,
                true,
            ));
        }

        Ok(())
    }

    /// Record a committed agent creation in every counter.
    pub async fn record_agent_creation(&self, user_id: &UserId, ip: IpAddr) -> Result<()> {
        let now = Utc::now();
        self.usage.record_creation(user_id, ip, now).await?;

        let mut record = self.usage.get_or_create(user_id).await?;
        if month_key(record.agents_month_reset_at) != month_key(now) {
            record.agents_this_month = 0;
            record.agents_month_reset_at = now;
        }
        record.agents_this_month += 1;
        self.usage.update(&record).await?;
        Ok(())
    }

    /// The user's monthly counter, applying the calendar reset lazily.
    async fn monthly_count(&self, user_id: &UserId) -> Result<u64> {
        let record = self.usage.get_or_create(user_id).await?;
        if month_key(record.agents_month_reset_at) != month_key(Utc::now()) {
            info!(%user_id, "monthly agent counter rolled over");
            let mut reset = record;
            reset.agents_this_month = 0;
            reset.agents_month_reset_at = Utc::now();
            self.usage.update(&reset).await?;
            return Ok(0);
        }
        Ok(record.agents_this_month)
    }
}

fn month_key(at: chrono::DateTime<Utc>) -> (i32, u32) {
    (at.year(), at.month())
}

fn quota_error(limit_type: LimitType, current: u64, max: u64, monthly: bool) -> CoreError {
    CoreError::Quota(QuotaDetail {
        limit_type,
        current,
        max,
        resource_type: "agent".to_string(),
        is_monthly_limit: monthly,
    })
}

fn internal(error: anyhow::Error) -> CoreError {
    CoreError::Validation(format!("usage accounting unavailable: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ariana_store::MemoryStore;

    fn ip() -> IpAddr {
        "192.0.2.1".parse().unwrap()
    }

    fn guard_with(limits: QuotaLimits) -> QuotaGuard {
        QuotaGuard::new(Arc::new(MemoryStore::new()), limits)
    }

    #[tokio::test]
    async fn minute_window_rejects_with_detail() {
        let guard = guard_with(QuotaLimits {
            per_minute: 2,
            ..QuotaLimits::default()
        });
        let user = UserId("u1".into());

        for _ in 0..2 {
            guard.check_agent_creation(&user, ip()).await.unwrap();
            guard.record_agent_creation(&user, ip()).await.unwrap();
        }

        match guard.check_agent_creation(&user, ip()).await.unwrap_err() {
            CoreError::Quota(detail) => {
                assert_eq!(detail.limit_type, LimitType::Minute);
                assert_eq!(detail.current, 2);
                assert_eq!(detail.max, 2);
                assert!(!detail.is_monthly_limit);
                assert_eq!(detail.resource_type, "agent");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn monthly_limit_is_flagged_monthly() {
        let guard = guard_with(QuotaLimits {
            per_minute: 1000,
            per_hour: 1000,
            per_day: 1000,
            per_month: 3,
            per_ip_per_hour: 1000,
        });
        let user = UserId("u1".into());

        for _ in 0..3 {
            guard.record_agent_creation(&user, ip()).await.unwrap();
        }

        match guard.check_agent_creation(&user, ip()).await.unwrap_err() {
            CoreError::Quota(detail) => {
                assert_eq!(detail.limit_type, LimitType::Month);
                assert!(detail.is_monthly_limit);
                assert_eq!(detail.current, 3);
                assert_eq!(detail.max, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ip_window_spans_users() {
        let guard = guard_with(QuotaLimits {
            per_minute: 1000,
            per_hour: 1000,
            per_day: 1000,
            per_month: 1000,
            per_ip_per_hour: 2,
        });

        guard
            .record_agent_creation(&UserId("u1".into()), ip())
            .await
            .unwrap();
        guard
            .record_agent_creation(&UserId("u2".into()), ip())
            .await
            .unwrap();

        let err = guard
            .check_agent_creation(&UserId("u3".into()), ip())
            .await
            .unwrap_err();
        match err {
            CoreError::Quota(detail) => assert_eq!(detail.limit_type, LimitType::Ip),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

//! Age gate for cannabis-flagged sessions and tracks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use serenity::all::{GuildId, UserId};
use tracing::{debug, info};

use crate::cache::TtlCache;
use crate::database::Database;
use crate::database::models::AgeVerification;
use crate::database::models::age_verification::STATUS_VERIFIED;
use crate::error::{DenyReason, MusicError, MusicResult};
use crate::metrics::METRICS;

/// Source of truth for a member's age verification.
#[cfg_attr(test, mockall::automock)]
pub trait AgeVerifier: Send + Sync {
    fn lookup(&self, user_id: UserId, guild_id: GuildId) -> MusicResult<Option<AgeVerification>>;
}

/// Reads the `age_verifications` table maintained by the verification flow.
pub struct DbAgeVerifier {
    db: Database,
}

impl DbAgeVerifier {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl AgeVerifier for DbAgeVerifier {
    fn lookup(&self, user_id: UserId, guild_id: GuildId) -> MusicResult<Option<AgeVerification>> {
        let (user, guild) = (user_id.to_string(), guild_id.to_string());
        Ok(self
            .db
            .with_conn(|conn| AgeVerification::find(conn, &user, &guild))?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
}

impl AccessDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
        }
    }
}

/// Judge one verification record at `now`.
pub fn evaluate(record: Option<&AgeVerification>, now: NaiveDateTime) -> AccessDecision {
    let Some(record) = record else {
        return AccessDecision::deny(DenyReason::NotFound);
    };
    if record.expires_at.is_some_and(|expires| expires <= now) {
        return AccessDecision::deny(DenyReason::Expired);
    }
    if record.status != STATUS_VERIFIED || !record.is_21_plus {
        return AccessDecision::deny(DenyReason::NotVerified);
    }
    AccessDecision::allow()
}

pub struct AccessGate {
    verifier: Arc<dyn AgeVerifier>,
    cache: TtlCache<(UserId, GuildId), AccessDecision>,
}

impl AccessGate {
    pub fn new(verifier: Arc<dyn AgeVerifier>, ttl: Duration) -> Self {
        Self {
            verifier,
            cache: TtlCache::new(ttl),
        }
    }

    /// Decide whether `user_id` may use cannabis-flagged content in `guild_id`.
    /// A denial is a normal `Ok`; only lookup failures are errors.
    pub fn validate_cannabis_access(
        &self,
        user_id: UserId,
        guild_id: GuildId,
    ) -> MusicResult<AccessDecision> {
        let key = (user_id, guild_id);
        if let Some(decision) = self.cache.get(&key) {
            debug!("Access cache hit for user {} in guild {}", user_id, guild_id);
            return Ok(decision);
        }

        let record = self.verifier.lookup(user_id, guild_id)?;
        let decision = evaluate(record.as_ref(), Utc::now().naive_utc());
        self.cache.insert(key, decision);

        if let Some(reason) = decision.reason {
            METRICS.inc_access_denials();
            info!(
                "Cannabis access denied for user {} in guild {}: {}",
                user_id, guild_id, reason
            );
        }
        Ok(decision)
    }

    /// Like `validate_cannabis_access`, but a denial becomes `AccessDenied`.
    pub fn require_cannabis_access(&self, user_id: UserId, guild_id: GuildId) -> MusicResult<()> {
        let decision = self.validate_cannabis_access(user_id, guild_id)?;
        match decision.reason {
            Some(reason) if !decision.allowed => Err(MusicError::AccessDenied(reason)),
            _ => Ok(()),
        }
    }

    pub fn invalidate(&self, user_id: UserId, guild_id: GuildId) {
        self.cache.invalidate(&(user_id, guild_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    fn record(status: &str, is_21_plus: bool, expires_in_days: Option<i64>) -> AgeVerification {
        let now = Utc::now().naive_utc();
        AgeVerification {
            user_id: "100".into(),
            guild_id: "1".into(),
            is_21_plus,
            status: status.into(),
            verified_at: Some(now),
            expires_at: expires_in_days.map(|d| now + ChronoDuration::days(d)),
        }
    }

    #[test]
    fn evaluate_covers_every_reason() {
        let now = Utc::now().naive_utc();
        assert_eq!(evaluate(None, now).reason, Some(DenyReason::NotFound));
        assert_eq!(
            evaluate(Some(&record("pending", true, None)), now).reason,
            Some(DenyReason::NotVerified)
        );
        assert_eq!(
            evaluate(Some(&record("verified", false, None)), now).reason,
            Some(DenyReason::NotVerified)
        );
        assert_eq!(
            evaluate(Some(&record("verified", true, Some(-1))), now).reason,
            Some(DenyReason::Expired)
        );
        assert!(evaluate(Some(&record("verified", true, Some(30))), now).allowed);
        assert!(evaluate(Some(&record("verified", true, None)), now).allowed);
    }

    #[test]
    fn cached_decision_skips_the_verifier() {
        let mut verifier = MockAgeVerifier::new();
        verifier
            .expect_lookup()
            .with(eq(UserId::new(100)), eq(GuildId::new(1)))
            .times(1)
            .returning(|_, _| Ok(Some(record("verified", true, None))));
        let gate = AccessGate::new(Arc::new(verifier), Duration::from_secs(300));

        for _ in 0..3 {
            assert!(gate
                .validate_cannabis_access(UserId::new(100), GuildId::new(1))
                .unwrap()
                .allowed);
        }
    }

    #[test]
    fn invalidate_forces_a_fresh_lookup() {
        let mut verifier = MockAgeVerifier::new();
        let mut calls = 0;
        verifier.expect_lookup().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(None)
            } else {
                Ok(Some(record("verified", true, None)))
            }
        });
        let gate = AccessGate::new(Arc::new(verifier), Duration::from_secs(300));
        let (user, guild) = (UserId::new(100), GuildId::new(1));

        assert!(matches!(
            gate.require_cannabis_access(user, guild),
            Err(MusicError::AccessDenied(DenyReason::NotFound))
        ));
        gate.invalidate(user, guild);
        gate.require_cannabis_access(user, guild).unwrap();
    }

    #[test]
    fn lookup_failures_propagate() {
        let mut verifier = MockAgeVerifier::new();
        verifier
            .expect_lookup()
            .returning(|_, _| Err(MusicError::Database(diesel::result::Error::BrokenTransactionManager)));
        let gate = AccessGate::new(Arc::new(verifier), Duration::from_secs(300));
        let err = gate
            .validate_cannabis_access(UserId::new(1), GuildId::new(1))
            .unwrap_err();
        assert!(!err.is_expected());
    }

    #[test]
    fn db_verifier_reads_the_table() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| AgeVerification::upsert(conn, &record("verified", true, None)))
            .unwrap();
        let gate = AccessGate::new(
            Arc::new(DbAgeVerifier::new(db)),
            Duration::from_secs(300),
        );
        assert!(gate
            .validate_cannabis_access(UserId::new(100), GuildId::new(1))
            .unwrap()
            .allowed);
        assert_eq!(
            gate.validate_cannabis_access(UserId::new(200), GuildId::new(1))
                .unwrap()
                .reason,
            Some(DenyReason::NotFound)
        );
    }
}

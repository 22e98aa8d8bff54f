//! Cache for one short-lived credential fetched from an external collaborator
use super::types::TimeStamp;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry<T> {
    token: T,
    expires_at: TimeStamp<Utc>,
}

/// Holds a token until it is about to expire.
///
/// A token is refreshed once fewer than `refresh_margin` remain before its
/// expiry, so callers never hand out a credential that lapses mid-request.
#[derive(Debug)]
pub struct TokenCache<T> {
    entry: Mutex<Option<Entry<T>>>,
    refresh_margin: Duration,
}

impl<T: Clone> TokenCache<T> {
    pub fn new(refresh_margin: Duration) -> Self {
        Self {
            entry: Mutex::new(None),
            refresh_margin,
        }
    }

    pub fn get_or_refresh<F, E>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<(T, Duration), E>,
    {
        self.get_or_refresh_at(fetch, &TimeStamp::new())
    }

    pub fn get_or_refresh_at<F, E>(&self, fetch: F, now: &TimeStamp<Utc>) -> Result<T, E>
    where
        F: FnOnce() -> Result<(T, Duration), E>,
    {
        // a poisoned lock only means a previous fetch panicked; the slot is still usable
        let mut slot = self.entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(entry) = slot.as_ref() {
            if entry.expires_at.since(now) > to_delta(self.refresh_margin) {
                return Ok(entry.token.clone());
            }
        }

        let (token, lifetime) = fetch()?;
        let expires_at = now
            .to_datetime_utc()
            .checked_add_signed(to_delta(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        tracing::debug!(lifetime_secs = lifetime.as_secs(), "token refreshed");
        *slot = Some(Entry {
            token: token.clone(),
            expires_at: TimeStamp::from(expires_at),
        });
        Ok(token)
    }

    pub fn invalidate(&self) {
        let mut slot = self.entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

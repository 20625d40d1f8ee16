// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured log events for cache activity.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheActivity {
    Hit,
    Miss,
    Joined,
    Expired,
    Invalidated,
    Populated,
    Broadcast,
    Failed,
    Canceled,
    Collected,
    Bypass,
}

impl CacheActivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "cache.hit",
            Self::Miss => "cache.miss",
            Self::Joined => "cache.joined",
            Self::Expired => "cache.expired",
            Self::Invalidated => "cache.invalidated",
            Self::Populated => "cache.populated",
            Self::Broadcast => "cache.broadcast",
            Self::Failed => "cache.failed",
            Self::Canceled => "cache.canceled",
            Self::Collected => "cache.collected",
            Self::Bypass => "cache.bypass",
        }
    }
}

/// Emits a single cache event for `key`.
pub(crate) fn record(name: &'static str, key: &str, activity: CacheActivity) {
    emit(name, Some(key), activity);
}

/// Emits a cache event for a call that has no key; the `cache.key` field is left out.
pub(crate) fn record_unkeyed(name: &'static str, activity: CacheActivity) {
    emit(name, None, activity);
}

fn emit(name: &'static str, key: Option<&str>, activity: CacheActivity) {
    let activity_name = activity.as_str();

    // Tracing levels must be constants.
    macro_rules! emit_event {
        ($level:ident) => {
            tracing::$level!(cache.name = name, cache.key = key, cache.activity = activity_name, "swr.event")
        };
    }

    match activity {
        CacheActivity::Failed => emit_event!(warn),
        CacheActivity::Expired | CacheActivity::Invalidated | CacheActivity::Collected => emit_event!(info),
        CacheActivity::Hit
        | CacheActivity::Miss
        | CacheActivity::Joined
        | CacheActivity::Populated
        | CacheActivity::Broadcast
        | CacheActivity::Canceled
        | CacheActivity::Bypass => emit_event!(debug),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LogCapture;

    #[test]
    fn event_contains_all_fields() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        record("profiles", "user:1", CacheActivity::Populated);

        capture.assert_contains("swr.event");
        capture.assert_contains("cache.name=\"profiles\"");
        capture.assert_contains("cache.key=\"user:1\"");
        capture.assert_contains("cache.populated");
    }

    #[test]
    fn unkeyed_event_omits_key() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());

        record_unkeyed("profiles", CacheActivity::Bypass);

        capture.assert_contains("cache.bypass");
        assert!(!capture.output().contains("cache.key"));
    }

    #[test]
    fn severity_follows_activity() {
        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        record("swirl", "user:1", CacheActivity::Failed);
        capture.assert_contains("WARN");

        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        record("swirl", "user:1", CacheActivity::Collected);
        capture.assert_contains("INFO");

        let capture = LogCapture::new();
        let _guard = tracing::subscriber::set_default(capture.subscriber());
        record_unkeyed("swirl", CacheActivity::Hit);
        capture.assert_contains("DEBUG");
    }

    #[test]
    fn activity_names_are_unique() {
        let all = [
            CacheActivity::Hit,
            CacheActivity::Miss,
            CacheActivity::Joined,
            CacheActivity::Expired,
            CacheActivity::Invalidated,
            CacheActivity::Populated,
            CacheActivity::Broadcast,
            CacheActivity::Failed,
            CacheActivity::Canceled,
            CacheActivity::Collected,
            CacheActivity::Bypass,
        ];
        let names: std::collections::HashSet<_> = all.iter().map(|a| a.as_str()).collect();
        assert_eq!(names.len(), all.len());
    }
}

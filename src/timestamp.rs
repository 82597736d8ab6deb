use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime};

/// A Unix timestamp in whole seconds, used for credential and session expiry.
///
/// Serialized as a JSON integer. Deserialization also accepts a stringified integer
/// (`"1699999999"`), which is how quantities are sometimes written by other tooling.
///
/// An entry stamped with `expires_at` is live strictly before that second and expired from it on,
/// see [`UnixTimestamp::has_passed`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash, Default)]
pub struct UnixTimestamp(u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TimestampVisitor;

        impl Visitor<'_> for TimestampVisitor {
            type Value = UnixTimestamp;

            fn expecting(&self, formatter: &mut Formatter) -> fmt::Result {
                formatter.write_str("a non-negative integer of seconds since the Unix epoch")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(UnixTimestamp(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                u64::try_from(value)
                    .map(UnixTimestamp)
                    .map_err(|_| E::custom("timestamp must be a non-negative integer"))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value
                    .trim()
                    .parse::<u64>()
                    .map(UnixTimestamp)
                    .map_err(|_| E::custom("timestamp must be a non-negative integer"))
            }
        }

        deserializer.deserialize_any(TimestampVisitor)
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<Duration> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        UnixTimestamp(self.0.saturating_add(rhs.as_secs()))
    }
}

impl Sub<Duration> for UnixTimestamp {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        UnixTimestamp(self.0.saturating_sub(rhs.as_secs()))
    }
}

impl UnixTimestamp {
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Current wall-clock time. A clock set before the epoch reads as zero.
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self(now)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Whether an entry expiring at `self` is already expired at `now`.
    pub fn has_passed(&self, now: UnixTimestamp) -> bool {
        self.0 <= now.0
    }
}

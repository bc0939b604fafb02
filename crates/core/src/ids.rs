use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(CorrelationId);
uuid_id!(SnapshotId);

/// Parcel tracking code as printed on the label.
///
/// Scanner input is normalized on parse: surrounding whitespace is
/// trimmed and letters are upper-cased, so `" p1 "` and `"P1"` are the
/// same parcel.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrackingCode(String);

impl TrackingCode {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(CoreError::InvalidTrackingCode(raw.to_string()));
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TrackingCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TrackingCode {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TrackingCode> for String {
    fn from(code: TrackingCode) -> Self {
        code.0
    }
}

impl fmt::Debug for TrackingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackingCode({})", self.0)
    }
}

impl fmt::Display for TrackingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Agency,
    ReadyForContainer,
    ReadyForPallet,
    Dispatch,
    Container,
    Pallet,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agency => "agency",
            Self::ReadyForContainer => "ready_for_container",
            Self::ReadyForPallet => "ready_for_pallet",
            Self::Dispatch => "dispatch",
            Self::Container => "container",
            Self::Pallet => "pallet",
        }
    }
}

/// Identity of a logistics pool.
///
/// Source pools hold parcels waiting to be grouped; aggregates are
/// numbered dispatch, container and pallet instances.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PoolKey {
    Agency(u64),
    ReadyForContainer,
    ReadyForPallet,
    Dispatch(u64),
    Container(u64),
    Pallet(u64),
}

impl PoolKey {
    pub fn kind(&self) -> PoolKind {
        match self {
            Self::Agency(_) => PoolKind::Agency,
            Self::ReadyForContainer => PoolKind::ReadyForContainer,
            Self::ReadyForPallet => PoolKind::ReadyForPallet,
            Self::Dispatch(_) => PoolKind::Dispatch,
            Self::Container(_) => PoolKind::Container,
            Self::Pallet(_) => PoolKind::Pallet,
        }
    }

    /// True for numbered destination aggregates (dispatch, container, pallet).
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Dispatch(_) | Self::Container(_) | Self::Pallet(_))
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let upper = raw.trim().to_ascii_uppercase();
        match upper.as_str() {
            "READY-CONTAINER" => return Ok(Self::ReadyForContainer),
            "READY-PALLET" => return Ok(Self::ReadyForPallet),
            _ => {}
        }
        let (prefix, id) = upper
            .split_once('-')
            .ok_or_else(|| CoreError::InvalidPoolKey(raw.to_string()))?;
        let id: u64 = id
            .parse()
            .map_err(|_| CoreError::InvalidPoolKey(raw.to_string()))?;
        match prefix {
            "AGENCY" => Ok(Self::Agency(id)),
            "DISPATCH" => Ok(Self::Dispatch(id)),
            "CONTAINER" => Ok(Self::Container(id)),
            "PALLET" => Ok(Self::Pallet(id)),
            _ => Err(CoreError::InvalidPoolKey(raw.to_string())),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agency(id) => write!(f, "AGENCY-{id}"),
            Self::ReadyForContainer => f.write_str("READY-CONTAINER"),
            Self::ReadyForPallet => f.write_str("READY-PALLET"),
            Self::Dispatch(id) => write!(f, "DISPATCH-{id}"),
            Self::Container(id) => write!(f, "CONTAINER-{id}"),
            Self::Pallet(id) => write!(f, "PALLET-{id}"),
        }
    }
}

impl FromStr for PoolKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PoolKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PoolKey> for String {
    fn from(key: PoolKey) -> Self {
        key.to_string()
    }
}

/// Query parameters identifying one paginated view of a pool.
///
/// Parameters live in an ordered map, so two keys built from the same
/// pairs in a different order compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ViewKey {
    params: BTreeMap<String, String>,
}

impl ViewKey {
    /// The unfiltered view.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_unfiltered(&self) -> bool {
        self.params.is_empty()
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            return f.write_str("*");
        }
        for (i, (k, v)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

/// BLAKE3 digest of a view's encoded contents.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ViewDigest([u8; 32]);

impl ViewDigest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ViewDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewDigest({:02x}{:02x}...)", self.0[0], self.0[1])
    }
}

impl fmt::Display for ViewDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

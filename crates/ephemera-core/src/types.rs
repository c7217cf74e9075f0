//! Identifiers, generations and principals.

use std::{fmt, ops::Add, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::EkError;

/// Rotation counter for one principal's ephemeral key.
///
/// Generations start at [`EkGeneration::FIRST`] and grow by exactly one per
/// successful publish.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EkGeneration(pub u64);

impl EkGeneration {
    /// Generation assigned when a principal has never published.
    pub const FIRST: Self = Self(1);

    /// The generation after this one, if the counter has room.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Generation to publish after `previous` (or the first one).
    ///
    /// `previous` usually comes from the server, so an exhausted counter is
    /// an invalid statement rather than a panic.
    pub fn after(previous: Option<Self>) -> Result<Self, EkError> {
        match previous {
            None => Ok(Self::FIRST),
            Some(generation) => generation.next().ok_or_else(|| {
                EkError::InvalidStatement(format!("generation {generation} has no successor"))
            }),
        }
    }
}

impl fmt::Display for EkGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock time in seconds since the Unix epoch.
///
/// Statement ctimes come from the Merkle root, so every comparison in the
/// engine is between server-issued timestamps unless noted otherwise.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct UnixTime(pub u64);

impl UnixTime {
    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn since(self, earlier: Self) -> Duration {
        Duration::from_secs(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for UnixTime {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0.saturating_add(rhs.as_secs()))
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Wrap an identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Device identifier.
    DeviceId
);
string_id!(
    /// User identifier.
    Uid
);
string_id!(
    /// Team identifier.
    TeamId
);

/// The four levels of the ephemeral key hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EkKind {
    /// Per-device key
    Device,
    /// Per-user key, boxed to every device
    User,
    /// Per-team key, boxed to every member's user key
    Team,
    /// Per-(team, bot) key, derived from the team key
    Teambot,
}

impl EkKind {
    /// Short name used in storage keys and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Device => "deviceEK",
            Self::User => "userEK",
            Self::Team => "teamEK",
            Self::Teambot => "teambotEK",
        }
    }
}

impl fmt::Display for EkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A team and one of its restricted bot members.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeambotId {
    /// Team the bot belongs to
    pub team: TeamId,
    /// The bot's user id
    pub bot: Uid,
}

impl TeambotId {
    /// Pair a team with a bot.
    pub fn new(team: TeamId, bot: Uid) -> Self {
        Self { team, bot }
    }
}

impl fmt::Display for TeambotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.team, self.bot)
    }
}

/// The entity a generation counter is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Principal {
    /// A single device
    Device(DeviceId),
    /// A user
    User(Uid),
    /// A team
    Team(TeamId),
    /// A bot within a team
    Teambot(TeambotId),
}

impl Principal {
    /// Key kind this principal publishes.
    pub fn kind(&self) -> EkKind {
        match self {
            Self::Device(_) => EkKind::Device,
            Self::User(_) => EkKind::User,
            Self::Team(_) => EkKind::Team,
            Self::Teambot(_) => EkKind::Teambot,
        }
    }

    /// Storage-safe form: kind plus hex-encoded identifier.
    ///
    /// Hex keeps arbitrary identifiers from colliding with the `/` separator.
    pub fn storage_component(&self) -> String {
        let id = match self {
            Self::Device(id) => hex::encode(id.as_str()),
            Self::User(id) => hex::encode(id.as_str()),
            Self::Team(id) => hex::encode(id.as_str()),
            Self::Teambot(id) => {
                format!("{}.{}", hex::encode(id.team.as_str()), hex::encode(id.bot.as_str()))
            },
        };
        format!("{}/{id}", self.kind())
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(id) => write!(f, "device:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::Team(id) => write!(f, "team:{id}"),
            Self::Teambot(id) => write!(f, "teambot:{id}"),
        }
    }
}

/// Who a box is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Recipient {
    /// A device, via its device key
    Device(DeviceId),
    /// A user, via their user key
    User(Uid),
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(id) => write!(f, "device:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Hash of the Merkle root a statement was created against.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HashMeta(pub [u8; 32]);

impl fmt::Debug for HashMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashMeta({})", hex::encode(self.0))
    }
}

/// Snapshot of the server's Merkle tree used to timestamp keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleRoot {
    /// Server time of the root
    pub ctime: UnixTime,
    /// Root hash
    pub hash_meta: HashMeta,
}

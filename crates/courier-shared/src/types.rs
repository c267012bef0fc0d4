use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{
    CONVERSATION_ROOM_PREFIX, DEFAULT_AVATAR_URL, DIRECT_PREFIX, TIER_ROOM_PREFIX,
    USER_ROOM_PREFIX,
};

// User identity = opaque id issued by the account service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id can appear in a `direct_{a}_{b}` conversation id:
    /// non-empty and free of the `_` separator.
    pub fn fits_direct_id(&self) -> bool {
        !self.0.is_empty() && !self.0.contains('_')
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Conversation identifier.
///
/// Direct conversations are named `direct_{a}_{b}` with the two member
/// ids sorted, so both parties derive the same id independently. Group
/// conversation ids are opaque.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Canonical id of the direct conversation between `a` and `b`.
    ///
    /// Both ids must satisfy [`UserId::fits_direct_id`]; the gateway refuses
    /// credentials for any other id.
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{DIRECT_PREFIX}{lo}_{hi}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_direct(&self) -> bool {
        self.0.starts_with(DIRECT_PREFIX)
    }

    /// Canonicalize a client-supplied id.
    ///
    /// `direct_b_a` becomes `direct_a_b`. Ids that are not direct, or
    /// whose suffix does not split into exactly two non-empty member
    /// ids, are returned unchanged.
    pub fn normalize(&self) -> ConversationId {
        match self.split_direct() {
            Some((a, b)) => Self::direct(&UserId::new(a), &UserId::new(b)),
            None => self.clone(),
        }
    }

    /// The two members encoded in a direct id, sorted.
    pub fn direct_members(&self) -> Option<(UserId, UserId)> {
        let (a, b) = self.split_direct()?;
        let (a, b) = (UserId::new(a), UserId::new(b));
        Some(if a <= b { (a, b) } else { (b, a) })
    }

    fn split_direct(&self) -> Option<(&str, &str)> {
        let rest = self.0.strip_prefix(DIRECT_PREFIX)?;
        let mut parts = rest.split('_');
        let a = parts.next().filter(|p| !p.is_empty())?;
        let b = parts.next().filter(|p| !p.is_empty())?;
        if parts.next().is_some() {
            return None;
        }
        Some((a, b))
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Cosmetic membership badge. Ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Starter,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Starter => "starter",
            Tier::Silver => "silver",
            Tier::Gold => "gold",
            Tier::Platinum => "platinum",
            Tier::Diamond => "diamond",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starter" => Ok(Tier::Starter),
            "silver" => Ok(Tier::Silver),
            "gold" => Ok(Tier::Gold),
            "platinum" => Ok(Tier::Platinum),
            "diamond" => Ok(Tier::Diamond),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// A server-side broadcast group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    User(UserId),
    Conversation(ConversationId),
    Tier(Tier),
}

impl Room {
    /// Room of a conversation. The id is normalized first.
    pub fn conversation(id: &ConversationId) -> Self {
        Room::Conversation(id.normalize())
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "{USER_ROOM_PREFIX}{id}"),
            Room::Conversation(id) => write!(f, "{CONVERSATION_ROOM_PREFIX}{id}"),
            Room::Tier(tier) => write!(f, "{TIER_ROOM_PREFIX}{tier}"),
        }
    }
}

/// Resolved identity attached to a connection for its whole lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub email: Option<String>,
    pub display_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: String,
    pub tier: Tier,
}

impl Identity {
    /// Identity built from token claims alone, used when no stored
    /// profile is available.
    pub fn from_claims(user_id: UserId, email: Option<String>) -> Self {
        let display_name = email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|local| !local.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| user_id.to_string());
        Self {
            user_id,
            email,
            display_name,
            photo_url: DEFAULT_AVATAR_URL.to_string(),
            tier: Tier::Starter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_id_symmetry() {
        let pairs = [("alice", "bob"), ("u1", "u2"), ("Zed", "abe"), ("x", "x")];
        for (a, b) in pairs {
            let (a, b) = (UserId::from(a), UserId::from(b));
            assert_eq!(ConversationId::direct(&a, &b), ConversationId::direct(&b, &a));
        }
    }

    #[test]
    fn test_normalize_sorts_members() {
        let id = ConversationId::from("direct_bob_alice");
        assert_eq!(id.normalize().as_str(), "direct_alice_bob");
        assert_eq!(id.normalize(), id.normalize().normalize());
    }

    #[test]
    fn test_normalize_leaves_groups_and_malformed_ids() {
        for raw in ["group-42", "direct_", "direct_a", "direct_a_b_c", "direct__b"] {
            let id = ConversationId::from(raw);
            assert_eq!(id.normalize(), id);
        }
    }

    #[test]
    fn test_underscore_user_ids_do_not_fit_direct_ids() {
        assert!(UserId::from("alice").fits_direct_id());
        assert!(!UserId::from("alice_smith").fits_direct_id());
        assert!(!UserId::from("").fits_direct_id());

        let id = ConversationId::direct(&"alice_smith".into(), &"bob".into());
        assert!(id.direct_members().is_none());
    }

    #[test]
    fn test_direct_members() {
        let id = ConversationId::from("direct_zoe_adam");
        let (a, b) = id.direct_members().unwrap();
        assert_eq!(a.as_str(), "adam");
        assert_eq!(b.as_str(), "zoe");
        assert!(ConversationId::from("team").direct_members().is_none());
    }

    #[test]
    fn test_room_names() {
        assert_eq!(Room::User("u1".into()).to_string(), "user:u1");
        assert_eq!(
            Room::conversation(&"direct_b_a".into()).to_string(),
            "conversation:direct_a_b"
        );
        assert_eq!(Room::Tier(Tier::Gold).to_string(), "tier:gold");
    }

    #[test]
    fn test_tier_ordering_and_parse() {
        assert!(Tier::Starter < Tier::Diamond);
        assert_eq!("Gold".parse::<Tier>().unwrap(), Tier::Gold);
        assert!("mythic".parse::<Tier>().is_err());
    }

    #[test]
    fn test_identity_from_claims_defaults() {
        let id = Identity::from_claims("u1".into(), Some("jane.doe@example.com".into()));
        assert_eq!(id.display_name, "jane.doe");
        assert_eq!(id.photo_url, DEFAULT_AVATAR_URL);
        assert_eq!(id.tier, Tier::Starter);

        let anon = Identity::from_claims("u2".into(), None);
        assert_eq!(anon.display_name, "u2");
    }
}

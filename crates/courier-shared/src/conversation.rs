use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, UserId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

/// Name, photo and admins of a group conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub name: String,
    pub photo_url: Option<String>,
    pub admins: BTreeSet<UserId>,
}

/// Denormalized preview of the latest message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub text: String,
    pub sender_id: UserId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// A conversation record as held by the durable store.
///
/// `members` only changes through explicit add/remove, never through
/// message activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub members: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_info: Option<GroupInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// A direct conversation whose id is derived from its two members.
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        Self {
            id: ConversationId::direct(a, b),
            kind: ConversationKind::Direct,
            members: [a.clone(), b.clone()].into_iter().collect(),
            group_info: None,
            last_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn group(
        id: ConversationId,
        name: impl Into<String>,
        admin: &UserId,
        members: impl IntoIterator<Item = UserId>,
    ) -> Self {
        let mut members: BTreeSet<UserId> = members.into_iter().collect();
        members.insert(admin.clone());
        Self {
            id,
            kind: ConversationKind::Group,
            members,
            group_info: Some(GroupInfo {
                name: name.into(),
                photo_url: None,
                admins: [admin.clone()].into_iter().collect(),
            }),
            last_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }

    pub fn add_member(&mut self, user: UserId) -> bool {
        self.members.insert(user)
    }

    pub fn remove_member(&mut self, user: &UserId) -> bool {
        self.members.remove(user)
    }

    /// Members other than `viewer`, e.g. the recipients of a send.
    pub fn others<'a>(&'a self, viewer: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.members.iter().filter(move |m| *m != viewer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_conversation_members() {
        let a = UserId::from("alice");
        let b = UserId::from("bob");
        let conv = Conversation::direct(&b, &a);
        assert_eq!(conv.id.as_str(), "direct_alice_bob");
        assert!(conv.is_member(&a) && conv.is_member(&b));
        assert_eq!(conv.others(&a).collect::<Vec<_>>(), vec![&b]);
    }

    #[test]
    fn test_group_includes_admin() {
        let admin = UserId::from("owner");
        let conv = Conversation::group("g1".into(), "Deals", &admin, vec!["m1".into()]);
        assert_eq!(conv.members.len(), 2);
        assert!(conv.group_info.unwrap().admins.contains(&admin));
    }

    #[test]
    fn test_json_uses_wire_names() {
        let conv = Conversation::direct(&"a".into(), &"b".into());
        let json = serde_json::to_value(&conv).unwrap();
        assert_eq!(json["type"], "direct");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("groupInfo").is_none());
    }
}

//! Group records stored at `groups/{id}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{GroupId, UserId};

/// A named group of users.
///
/// `members` has set semantics: each user appears once and the creator is
/// always included. Membership is fixed after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub members: Vec<UserId>,
    pub created_by: UserId,
    /// Unix milliseconds
    pub created_at: i64,
}

impl Group {
    /// Build a group record. The creator is added to `members` if missing
    /// and duplicate members are dropped, keeping first-seen order.
    pub fn new(
        id: GroupId,
        name: impl Into<String>,
        members: impl IntoIterator<Item = UserId>,
        created_by: UserId,
        created_at: i64,
    ) -> Self {
        let mut unique: Vec<UserId> = Vec::new();
        for member in members.into_iter().chain(std::iter::once(created_by.clone())) {
            if !unique.contains(&member) {
                unique.push(member);
            }
        }
        Self {
            id,
            name: name.into(),
            members: unique,
            created_by,
            created_at,
        }
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains(user)
    }

    /// Parse a group snapshot stored under `groups/{key}`.
    ///
    /// The store key wins over any `id` field in the record. Records from
    /// older clients may store members as an object keyed by index.
    pub fn from_value(key: &str, value: &Value) -> Option<Self> {
        let id = GroupId::new(key).ok()?;
        let object = value.as_object()?;
        let name = object
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let members = object.get("members").map(parse_member_ids).unwrap_or_default();
        let created_by = object
            .get("createdBy")
            .and_then(Value::as_str)
            .and_then(|s| UserId::new(s).ok())
            .or_else(|| members.first().cloned())?;
        let created_at = object.get("createdAt").map(parse_timestamp).unwrap_or(0);
        Some(Self::new(id, name, members, created_by, created_at))
    }
}

/// Unix millis, or an RFC 3339 string as written by older clients
fn parse_timestamp(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| {
            value
                .as_str()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.timestamp_millis())
        })
        .unwrap_or(0)
}

/// Member ids from either a JSON array or an index-keyed object.
pub fn parse_member_ids(value: &Value) -> Vec<UserId> {
    let raw: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => Vec::new(),
    };
    let mut ids: Vec<UserId> = Vec::new();
    for id in raw.into_iter().filter_map(Value::as_str) {
        if let Ok(id) = UserId::new(id) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    #[test]
    fn test_creator_is_always_member() {
        let group = Group::new(
            GroupId::new("g1").unwrap(),
            "Hikers",
            vec![uid("bob"), uid("carol"), uid("bob")],
            uid("alice"),
            1000,
        );
        assert_eq!(group.members, vec![uid("bob"), uid("carol"), uid("alice")]);
        assert!(group.is_member(&uid("alice")));
    }

    #[test]
    fn test_serialized_field_names() {
        let group = Group::new(GroupId::new("g1").unwrap(), "Hikers", vec![], uid("alice"), 7);
        let value = serde_json::to_value(&group).unwrap();
        assert_eq!(value["createdBy"], json!("alice"));
        assert_eq!(value["createdAt"], json!(7));
        assert_eq!(value["members"], json!(["alice"]));
    }

    #[test]
    fn test_from_value_accepts_object_members() {
        let value = json!({
            "name": "Old",
            "members": {"0": "bob", "1": "alice"},
            "createdBy": "alice",
        });
        let group = Group::from_value("g9", &value).unwrap();
        assert_eq!(group.id.as_str(), "g9");
        assert_eq!(group.members, vec![uid("bob"), uid("alice")]);
        assert_eq!(group.created_at, 0);
    }

    #[test]
    fn test_from_value_accepts_iso_created_at() {
        let value = json!({
            "name": "Iso",
            "members": ["alice"],
            "createdBy": "alice",
            "createdAt": "2024-01-01T00:00:00.000Z",
        });
        let group = Group::from_value("g2", &value).unwrap();
        assert_eq!(group.created_at, 1_704_067_200_000);
    }

    #[test]
    fn test_from_value_rejects_garbage() {
        assert!(Group::from_value("g1", &json!("nope")).is_none());
        assert!(Group::from_value("bad/key", &json!({"members": ["a"]})).is_none());
        assert!(Group::from_value("g1", &json!({"name": "no members"})).is_none());
    }
}

//! Recipient Context and Permission Table
//!
//! Decides whether the active session may see a message, before any handler
//! runs. The category → roles table is fixed; a context can widen it with
//! explicit `events:<type>` permissions and narrow building-scoped events to
//! its assigned buildings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::protocol::{Category, Message};

/// Permission prefix that grants visibility of one event type
pub const EVENT_PERMISSION_PREFIX: &str = "events:";

/// Role of the active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Worker,
    Client,
}

impl UserRole {
    pub const ALL: [UserRole; 3] = [UserRole::Admin, UserRole::Worker, UserRole::Client];

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Worker => "worker",
            UserRole::Client => "client",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(UserRole::Admin),
            "worker" => Ok(UserRole::Worker),
            "client" => Ok(UserRole::Client),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Roles allowed to receive each category
pub fn allowed_roles(category: Category) -> &'static [UserRole] {
    match category {
        Category::Task | Category::Worker | Category::Inventory => {
            &[UserRole::Worker, UserRole::Admin]
        }
        Category::Building | Category::Analytics => &[UserRole::Client, UserRole::Admin],
        Category::System | Category::Emergency => &UserRole::ALL,
    }
}

/// Categories whose messages carry a `buildingId` that scoping applies to
fn is_building_scoped(category: Category) -> bool {
    matches!(
        category,
        Category::Task | Category::Building | Category::Inventory
    )
}

/// Identity of the active session, used for permission filtering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientContext {
    pub user_id: String,
    pub user_role: UserRole,
    /// Buildings this session may see; `None` means unrestricted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_ids: Option<Vec<String>>,
    /// Extra grants, e.g. `events:building_update` or `events:*`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

impl RecipientContext {
    pub fn new(user_id: impl Into<String>, user_role: UserRole) -> Self {
        Self {
            user_id: user_id.into(),
            user_role,
            building_ids: None,
            permissions: None,
        }
    }

    pub fn with_buildings(mut self, building_ids: Vec<String>) -> Self {
        self.building_ids = Some(building_ids);
        self
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    fn has_override(&self, kind: &str) -> bool {
        self.permissions.iter().flatten().any(|p| {
            p.strip_prefix(EVENT_PERMISSION_PREFIX)
                .map(|granted| granted == kind || granted == "*")
                .unwrap_or(false)
        })
    }

    fn can_see_building(&self, building_id: &str) -> bool {
        self.building_ids
            .as_ref()
            .map(|ids| ids.iter().any(|id| id == building_id))
            .unwrap_or(true)
    }
}

/// Why a message was withheld
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("no recipient context is set")]
    NoContext,

    #[error("role {role} may not receive {kind}")]
    Role { role: UserRole, kind: String },

    #[error("building {building_id} is outside the recipient's scope")]
    OutOfScope { building_id: String },
}

/// Evaluate the permission table for one message
///
/// Types outside the event taxonomy (control messages such as `pong`) are
/// not gated.
pub fn check(context: Option<&RecipientContext>, message: &Message) -> Result<(), Denial> {
    let Some(event_type) = message.event_type() else {
        return Ok(());
    };
    let context = context.ok_or(Denial::NoContext)?;
    let category = event_type.category();

    if !allowed_roles(category).contains(&context.user_role) && !context.has_override(&message.kind)
    {
        return Err(Denial::Role {
            role: context.user_role,
            kind: message.kind.clone(),
        });
    }

    if context.user_role != UserRole::Admin && is_building_scoped(category) {
        if let Some(building_id) = message.data_str("buildingId") {
            if !context.can_see_building(building_id) {
                return Err(Denial::OutOfScope {
                    building_id: building_id.to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventType;
    use serde_json::json;

    fn msg(event_type: EventType) -> Message {
        Message::event(event_type, json!({}))
    }

    #[test]
    fn test_task_messages_need_worker_or_admin() {
        let worker = RecipientContext::new("u1", UserRole::Worker);
        let admin = RecipientContext::new("u2", UserRole::Admin);
        let client = RecipientContext::new("u3", UserRole::Client);

        assert!(check(Some(&worker), &msg(EventType::TaskCompleted)).is_ok());
        assert!(check(Some(&admin), &msg(EventType::TaskUpdated)).is_ok());
        assert!(matches!(
            check(Some(&client), &msg(EventType::TaskCompleted)),
            Err(Denial::Role { role: UserRole::Client, .. })
        ));
    }

    #[test]
    fn test_building_update_denied_for_worker() {
        let worker = RecipientContext::new("u1", UserRole::Worker);
        assert!(check(Some(&worker), &msg(EventType::BuildingUpdate)).is_err());

        let client = RecipientContext::new("u3", UserRole::Client);
        assert!(check(Some(&client), &msg(EventType::BuildingUpdate)).is_ok());
    }

    #[test]
    fn test_emergency_allowed_for_every_role() {
        for role in UserRole::ALL {
            let ctx = RecipientContext::new("u", role);
            assert!(check(Some(&ctx), &msg(EventType::Emergency)).is_ok());
            assert!(check(Some(&ctx), &msg(EventType::SystemAlert)).is_ok());
        }
    }

    #[test]
    fn test_permission_override() {
        let worker = RecipientContext::new("u1", UserRole::Worker)
            .with_permissions(vec!["events:building_update".to_string()]);
        assert!(check(Some(&worker), &msg(EventType::BuildingUpdate)).is_ok());
        assert!(check(Some(&worker), &msg(EventType::AnalyticsUpdate)).is_err());

        let wildcard = RecipientContext::new("u1", UserRole::Client)
            .with_permissions(vec!["events:*".to_string()]);
        assert!(check(Some(&wildcard), &msg(EventType::TaskCompleted)).is_ok());

        let unrelated = RecipientContext::new("u1", UserRole::Worker)
            .with_permissions(vec!["reports:read".to_string()]);
        assert!(check(Some(&unrelated), &msg(EventType::BuildingUpdate)).is_err());
    }

    #[test]
    fn test_building_scope() {
        let worker = RecipientContext::new("u1", UserRole::Worker)
            .with_buildings(vec!["b1".to_string()]);

        let inside = Message::event(EventType::TaskUpdated, json!({"buildingId": "b1"}));
        let outside = Message::event(EventType::TaskUpdated, json!({"buildingId": "b9"}));
        let unscoped = Message::event(EventType::TaskUpdated, json!({"taskId": "t1"}));

        assert!(check(Some(&worker), &inside).is_ok());
        assert_eq!(
            check(Some(&worker), &outside),
            Err(Denial::OutOfScope {
                building_id: "b9".to_string()
            })
        );
        assert!(check(Some(&worker), &unscoped).is_ok());

        let admin = RecipientContext::new("a", UserRole::Admin).with_buildings(vec![]);
        assert!(check(Some(&admin), &outside).is_ok());
    }

    #[test]
    fn test_no_context_blocks_taxonomy_only() {
        assert_eq!(check(None, &msg(EventType::Emergency)), Err(Denial::NoContext));
        assert!(check(None, &Message::new("pong", json!(null))).is_ok());
    }

    #[test]
    fn test_context_json_shape() {
        let json = r#"{"userId":"u1","userRole":"worker","buildingIds":["b1"]}"#;
        let ctx: RecipientContext = serde_json::from_str(json).unwrap();
        assert_eq!(ctx.user_role, UserRole::Worker);
        assert_eq!(ctx.building_ids, Some(vec!["b1".to_string()]));
        assert!(ctx.permissions.is_none());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Admin".parse::<UserRole>(), Ok(UserRole::Admin));
        assert!("owner".parse::<UserRole>().is_err());
    }
}

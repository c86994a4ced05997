use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use super::error::DomainError;

pub use plancache_api_types::PlanVariant;

const MAX_ID_LEN: usize = 64;

/// Stable identifier of a plan, used as the field key in every plan keyspace.
///
/// Plan-group membership relies on a naming convention: the plan that occupies
/// bit `i` of a group mask is the one whose identifier is the decimal string of
/// `2^i` (see [`PlanId::for_group_bit`]). Only 64 plans can therefore take part
/// in groups.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    /// Validate an identifier received from a caller.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        validate_identifier(raw, "plan id")?;
        Ok(Self(raw.to_string()))
    }

    /// Identifier of the plan that sits at `bit` of a group mask.
    pub fn for_group_bit(bit: u32) -> Self {
        Self((1u64 << bit).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<String> for PlanId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PlanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an end user whose joined plans live in `plans-of-user:<uid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        validate_identifier(raw, "user id")?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_identifier(raw: &str, what: &str) -> Result<(), DomainError> {
    if raw.is_empty() {
        return Err(DomainError::validation(format!("{what} must not be empty")));
    }
    if raw.len() > MAX_ID_LEN {
        return Err(DomainError::validation(format!(
            "{what} must be at most {MAX_ID_LEN} characters"
        )));
    }
    if !raw
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(DomainError::validation(format!(
            "{what} may only contain ASCII letters, digits, `-` and `_`"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Older writers stored an unset index flag as nil.
fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// Cache-resident plan with its rules and items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub image: String,
    pub thumbnail: String,
    #[serde(default)]
    pub period: Option<i32>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub show_in_index: bool,
    pub rules: Vec<Rule>,
    pub items: Vec<Item>,
    /// Filled in on the read path only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_count: Option<i64>,
}

impl Plan {
    pub fn slim(&self) -> PlanSlim {
        PlanSlim {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            image: self.image.clone(),
            thumbnail: self.thumbnail.clone(),
            period: self.period,
            show_in_index: self.show_in_index,
            joined_count: self.joined_count,
        }
    }
}

/// Plan projection without nested rules and items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSlim {
    pub id: PlanId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub image: String,
    pub thumbnail: String,
    #[serde(default)]
    pub period: Option<i32>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub show_in_index: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_count: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanGroup {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub mask: u64,
    pub plans: Vec<Plan>,
}

/// A decoded plan in whichever projection the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PlanView {
    Full(Plan),
    Slim(PlanSlim),
}

impl PlanView {
    pub fn id(&self) -> &PlanId {
        match self {
            PlanView::Full(plan) => &plan.id,
            PlanView::Slim(plan) => &plan.id,
        }
    }

    pub fn joined_count(&self) -> Option<i64> {
        match self {
            PlanView::Full(plan) => plan.joined_count,
            PlanView::Slim(plan) => plan.joined_count,
        }
    }

    pub fn set_joined_count(&mut self, count: i64) {
        match self {
            PlanView::Full(plan) => plan.joined_count = Some(count),
            PlanView::Slim(plan) => plan.joined_count = Some(count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_bit_ids_are_powers_of_two() {
        assert_eq!(PlanId::for_group_bit(0).as_str(), "1");
        assert_eq!(PlanId::for_group_bit(1).as_str(), "2");
        assert_eq!(PlanId::for_group_bit(10).as_str(), "1024");
        assert_eq!(
            PlanId::for_group_bit(63).as_str(),
            "9223372036854775808"
        );
    }

    #[test]
    fn plan_id_accepts_uuids_and_numeric_ids() {
        assert!(PlanId::parse("3f2b8c1e-6c1a-4d4e-9f51-2b0c9e7d1a11").is_ok());
        assert!(PlanId::parse("1").is_ok());
        assert!(PlanId::parse("plan_basic").is_ok());
    }

    #[test]
    fn plan_id_rejects_malformed_values() {
        assert!(PlanId::parse("").is_err());
        assert!(PlanId::parse("a b").is_err());
        assert!(PlanId::parse("plans-of-user:1").is_err());
        assert!(PlanId::parse(&"x".repeat(65)).is_err());
    }

    #[test]
    fn slim_projection_drops_rules_and_items() {
        let plan = Plan {
            id: PlanId::from("1"),
            title: "Basic".to_string(),
            description: None,
            image: "img".to_string(),
            thumbnail: "thumb".to_string(),
            period: Some(30),
            show_in_index: true,
            rules: vec![Rule {
                id: "r1".to_string(),
                name: "n".to_string(),
                title: "t".to_string(),
                description: None,
            }],
            items: Vec::new(),
            joined_count: None,
        };

        let slim = plan.slim();
        assert_eq!(slim.id, plan.id);
        assert_eq!(slim.period, Some(30));

        let json = serde_json::to_value(&slim).expect("serialize");
        assert!(json.get("rules").is_none());
        assert!(json.get("joined_count").is_none());
    }

    #[test]
    fn view_augmentation_sets_count() {
        let mut view = PlanView::Slim(PlanSlim {
            id: PlanId::from("2"),
            title: String::new(),
            description: None,
            image: String::new(),
            thumbnail: String::new(),
            period: None,
            show_in_index: false,
            joined_count: None,
        });
        view.set_joined_count(7);
        assert_eq!(view.joined_count(), Some(7));
        assert_eq!(view.id().as_str(), "2");
    }
}

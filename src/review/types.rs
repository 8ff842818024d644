//! Review-state types: shared-lane rows and component identities.
//!
//! Entities live in a store keyed by stable IDs; relations are ID
//! references. Merges rewrite IDs rather than chasing pointers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::rules::EnumPolicy;

/// What a review row is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A suggested enum value for a field
    EnumValue,
    /// A component identity (sensor, switch, encoder) or one of its
    /// properties
    Component,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnumValue => "enum_value",
            Self::Component => "component",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "enum_value" => Some(Self::EnumValue),
            "component" => Some(Self::Component),
            _ => None,
        }
    }
}

/// AI confirmation lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmStatus {
    Pending,
    Confirmed,
}

impl ConfirmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "confirmed" => Self::Confirmed,
            _ => Self::Pending,
        }
    }

    /// `confirmed > pending`.
    pub fn more_progressed(self, other: Self) -> Self {
        if self == Self::Confirmed || other == Self::Confirmed {
            Self::Confirmed
        } else {
            Self::Pending
        }
    }
}

/// Key of one reviewable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReviewKey {
    pub category: String,
    pub target_kind: TargetKind,
    pub field_key: String,
    /// Normalized enum value or component identifier
    pub subject: String,
    /// Property key for component-property rows; empty otherwise
    #[serde(default)]
    pub property_key: String,
}

impl ReviewKey {
    /// Row for a suggested enum value.
    pub fn enum_value(category: &str, field_key: &str, value_norm: &str) -> Self {
        Self {
            category: category.to_string(),
            target_kind: TargetKind::EnumValue,
            field_key: field_key.to_string(),
            subject: value_norm.to_string(),
            property_key: String::new(),
        }
    }

    /// Row for a component identity's property.
    pub fn component_property(
        category: &str,
        field_key: &str,
        identity_id: &str,
        property_key: &str,
    ) -> Self {
        Self {
            category: category.to_string(),
            target_kind: TargetKind::Component,
            field_key: field_key.to_string(),
            subject: identity_id.to_string(),
            property_key: property_key.to_string(),
        }
    }
}

/// One shared-lane review row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRow {
    pub key: ReviewKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_candidate_id: Option<String>,
    pub ai_confirm_shared_status: ConfirmStatus,
    /// `None` until a user accepts; `Some(true)` afterwards
    pub user_accept_shared_status: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_policy: Option<EnumPolicy>,
    pub needs_review: bool,
    /// Entered by a human directly; immune to policy transitions
    pub manual: bool,
    /// Overridden by an operator; immune to policy transitions
    pub overridden: bool,
}

impl ReviewRow {
    /// Fresh pending row for a key.
    pub fn pending(key: ReviewKey) -> Self {
        Self {
            key,
            selected_value: None,
            selected_candidate_id: None,
            ai_confirm_shared_status: ConfirmStatus::Pending,
            user_accept_shared_status: None,
            enum_policy: None,
            needs_review: false,
            manual: false,
            overridden: false,
        }
    }
}

/// Action applied to a shared lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LaneAction {
    /// The automated reviewer confirms the current selection
    Confirm,
    /// A user accepts, possibly changing the selection
    Accept {
        selected_value: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        selected_candidate_id: Option<String>,
    },
}

/// A component identity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentIdentity {
    pub id: String,
    pub category: String,
    pub display_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
    /// property key -> value
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// What a merge did, for the log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub values_transferred: u32,
    pub values_kept_from_target: u32,
    pub review_rows_rewritten: u32,
    pub review_rows_merged: u32,
    pub aliases_added: u32,
}

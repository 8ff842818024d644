//! SQLite-backed review store: shared lanes, enum-policy transitions, and
//! component-identity merges.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::rules::{EnumPolicy, KnownValueSet};

use super::schema::{initialize_schema, is_initialized};
use super::types::{
    ComponentIdentity, ConfirmStatus, LaneAction, MergeReport, ReviewKey, ReviewRow, TargetKind,
};

fn policy_to_str(policy: EnumPolicy) -> &'static str {
    match policy {
        EnumPolicy::Closed => "closed",
        EnumPolicy::OpenPreferKnown => "open_prefer_known",
        EnumPolicy::Open => "open",
    }
}

fn policy_from_str(raw: &str) -> Option<EnumPolicy> {
    match raw {
        "closed" => Some(EnumPolicy::Closed),
        "open_prefer_known" => Some(EnumPolicy::OpenPreferKnown),
        "open" => Some(EnumPolicy::Open),
        _ => None,
    }
}

/// Durable review state for one category database.
pub struct ReviewStore {
    conn: Arc<Mutex<Connection>>,
}

impl ReviewStore {
    /// Open or create a review store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::store(e))?;
        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::store(e))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::store(e))?;
        initialize_schema(&conn).map_err(|e| Error::store(e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock connection: {e}")))?;
        f(&conn).map_err(|e| Error::store(e))
    }

    /// Insert or replace a review row.
    pub fn upsert_row(&self, row: &ReviewRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO key_review_state (
                    category, target_kind, field_key, subject, property_key,
                    selected_value, selected_candidate_id, ai_confirm_shared_status,
                    user_accept_shared_status, enum_policy, needs_review, manual,
                    overridden, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT (category, target_kind, field_key, subject, property_key)
                 DO UPDATE SET
                    selected_value = ?6, selected_candidate_id = ?7,
                    ai_confirm_shared_status = ?8, user_accept_shared_status = ?9,
                    enum_policy = ?10, needs_review = ?11, manual = ?12,
                    overridden = ?13, updated_at = ?14",
                params![
                    row.key.category,
                    row.key.target_kind.as_str(),
                    row.key.field_key,
                    row.key.subject,
                    row.key.property_key,
                    row.selected_value,
                    row.selected_candidate_id,
                    row.ai_confirm_shared_status.as_str(),
                    row.user_accept_shared_status.map(|_| "accepted"),
                    row.enum_policy.map(policy_to_str),
                    row.needs_review as i32,
                    row.manual as i32,
                    row.overridden as i32,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Read one review row.
    pub fn get_row(&self, key: &ReviewKey) -> Result<Option<ReviewRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT selected_value, selected_candidate_id, ai_confirm_shared_status,
                        user_accept_shared_status, enum_policy, needs_review, manual, overridden
                 FROM key_review_state
                 WHERE category = ?1 AND target_kind = ?2 AND field_key = ?3
                   AND subject = ?4 AND property_key = ?5",
                params![
                    key.category,
                    key.target_kind.as_str(),
                    key.field_key,
                    key.subject,
                    key.property_key
                ],
                |row| {
                    Ok(ReviewRow {
                        key: key.clone(),
                        selected_value: row.get(0)?,
                        selected_candidate_id: row.get(1)?,
                        ai_confirm_shared_status: ConfirmStatus::parse(
                            &row.get::<_, String>(2)?,
                        ),
                        user_accept_shared_status: row
                            .get::<_, Option<String>>(3)?
                            .map(|_| true),
                        enum_policy: row
                            .get::<_, Option<String>>(4)?
                            .as_deref()
                            .and_then(policy_from_str),
                        needs_review: row.get::<_, i32>(5)? != 0,
                        manual: row.get::<_, i32>(6)? != 0,
                        overridden: row.get::<_, i32>(7)? != 0,
                    })
                },
            )
            .optional()
        })
    }

    /// Apply a shared-lane action to a row, creating it when absent.
    ///
    /// `confirm` never changes the selection and never clears a user accept.
    /// `accept` with the same selection keeps the AI confirmation; a changed
    /// selection forces it back to pending.
    pub fn apply_shared_lane_state(
        &self,
        key: &ReviewKey,
        action: &LaneAction,
    ) -> Result<ReviewRow> {
        let mut row = self
            .get_row(key)?
            .unwrap_or_else(|| ReviewRow::pending(key.clone()));

        match action {
            LaneAction::Confirm => {
                row.ai_confirm_shared_status = ConfirmStatus::Confirmed;
            }
            LaneAction::Accept {
                selected_value,
                selected_candidate_id,
            } => {
                let same_selection = row.selected_value.as_deref() == Some(selected_value.as_str());
                if !same_selection {
                    row.selected_value = Some(selected_value.clone());
                    row.selected_candidate_id = selected_candidate_id.clone();
                    row.ai_confirm_shared_status = ConfirmStatus::Pending;
                }
                row.user_accept_shared_status = Some(true);
            }
        }

        self.upsert_row(&row)?;
        Ok(row)
    }

    /// Re-evaluate every non-manual, non-overridden row for a field after an
    /// enum policy change. Returns how many rows were updated.
    pub fn apply_enum_policy_transition(
        &self,
        category: &str,
        field_key: &str,
        new_policy: EnumPolicy,
        known: &KnownValueSet,
    ) -> Result<u32> {
        let rows: Vec<(String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT subject, property_key FROM key_review_state
                 WHERE category = ?1 AND target_kind = 'enum_value' AND field_key = ?2
                   AND manual = 0 AND overridden = 0",
            )?;
            let mapped = stmt.query_map(params![category, field_key], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            mapped.collect()
        })?;

        let mut updated = 0u32;
        for (subject, property_key) in rows {
            let needs_review = match new_policy {
                EnumPolicy::Closed => !known.contains(&subject),
                EnumPolicy::OpenPreferKnown | EnumPolicy::Open => false,
            };
            self.with_conn(|conn| {
                conn.execute(
                    "UPDATE key_review_state
                     SET enum_policy = ?1, needs_review = ?2, updated_at = ?3
                     WHERE category = ?4 AND target_kind = 'enum_value' AND field_key = ?5
                       AND subject = ?6 AND property_key = ?7",
                    params![
                        policy_to_str(new_policy),
                        needs_review as i32,
                        Utc::now().to_rfc3339(),
                        category,
                        field_key,
                        subject,
                        property_key
                    ],
                )?;
                Ok(())
            })?;
            updated += 1;
        }
        debug!(category, field_key, updated, "enum policy transition applied");
        Ok(updated)
    }

    /// Insert or replace a component identity and its values.
    pub fn upsert_identity(&self, identity: &ComponentIdentity) -> Result<()> {
        let aliases = serde_json::to_string(&identity.aliases)?;
        let links = serde_json::to_string(&identity.links)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO component_identities (id, category, display_name, aliases, links, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET
                    category = ?2, display_name = ?3, aliases = ?4, links = ?5, updated_at = ?6",
                params![
                    identity.id,
                    identity.category,
                    identity.display_name,
                    aliases,
                    links,
                    Utc::now().to_rfc3339()
                ],
            )?;
            conn.execute(
                "DELETE FROM identity_values WHERE identity_id = ?1",
                params![identity.id],
            )?;
            for (property_key, value) in &identity.values {
                conn.execute(
                    "INSERT INTO identity_values (identity_id, property_key, value)
                     VALUES (?1, ?2, ?3)",
                    params![identity.id, property_key, value],
                )?;
            }
            Ok(())
        })
    }

    /// Read one component identity.
    pub fn get_identity(&self, id: &str) -> Result<Option<ComponentIdentity>> {
        let base: Option<(String, String, String, String)> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, category, display_name, aliases, links
                 FROM component_identities WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
        })?;
        let Some((category, display_name, aliases, links)) = base else {
            return Ok(None);
        };

        let values: Vec<(String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT property_key, value FROM identity_values WHERE identity_id = ?1",
            )?;
            let rows = stmt.query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })?;

        Ok(Some(ComponentIdentity {
            id: id.to_string(),
            category,
            display_name,
            aliases: serde_json::from_str(&aliases).unwrap_or_default(),
            links: serde_json::from_str(&links).unwrap_or_default(),
            values: values.into_iter().collect::<BTreeMap<_, _>>(),
        }))
    }

    /// Merge a source identity into a target: the target wins on value
    /// collisions, source-exclusive values transfer, review rows are
    /// rewritten, and the source is deleted.
    pub fn merge_component_identities(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> Result<MergeReport> {
        let source = self
            .get_identity(source_id)?
            .ok_or_else(|| Error::store(format!("merge source '{source_id}' not found")))?;
        let mut target = self
            .get_identity(target_id)?
            .ok_or_else(|| Error::store(format!("merge target '{target_id}' not found")))?;

        let mut report = MergeReport::default();

        for (property_key, value) in source.values {
            if target.values.contains_key(&property_key) {
                report.values_kept_from_target += 1;
            } else {
                target.values.insert(property_key, value);
                report.values_transferred += 1;
            }
        }

        for link in source.links {
            if !target.links.contains(&link) {
                target.links.push(link);
            }
        }
        let mut incoming_aliases = source.aliases;
        incoming_aliases.push(source.display_name);
        for alias in incoming_aliases {
            if alias != target.display_name && !target.aliases.contains(&alias) {
                target.aliases.push(alias);
                report.aliases_added += 1;
            }
        }

        // Rewrite review rows that reference the source identity.
        let source_rows: Vec<(String, String, String, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT category, target_kind, field_key, property_key
                 FROM key_review_state WHERE subject = ?1",
            )?;
            let rows = stmt.query_map(params![source_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect()
        })?;

        for (category, target_kind, field_key, property_key) in source_rows {
            let Some(kind) = TargetKind::parse(&target_kind) else {
                continue;
            };
            let source_key = ReviewKey {
                category: category.clone(),
                target_kind: kind,
                field_key: field_key.clone(),
                subject: source_id.to_string(),
                property_key: property_key.clone(),
            };
            let target_key = ReviewKey {
                subject: target_id.to_string(),
                ..source_key.clone()
            };

            let source_row = self.get_row(&source_key)?;
            let target_row = self.get_row(&target_key)?;
            match (source_row, target_row) {
                (Some(source_row), Some(mut existing)) => {
                    // Collision: the more-progressed status wins per lane.
                    existing.ai_confirm_shared_status = existing
                        .ai_confirm_shared_status
                        .more_progressed(source_row.ai_confirm_shared_status);
                    existing.user_accept_shared_status = existing
                        .user_accept_shared_status
                        .or(source_row.user_accept_shared_status);
                    existing.needs_review = existing.needs_review && source_row.needs_review;
                    self.upsert_row(&existing)?;
                    report.review_rows_merged += 1;
                }
                (Some(mut source_row), None) => {
                    source_row.key = target_key;
                    self.upsert_row(&source_row)?;
                    report.review_rows_rewritten += 1;
                }
                _ => {}
            }
            self.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM key_review_state
                     WHERE category = ?1 AND target_kind = ?2 AND field_key = ?3
                       AND subject = ?4 AND property_key = ?5",
                    params![category, target_kind, field_key, source_id, property_key],
                )?;
                Ok(())
            })?;
        }

        self.upsert_identity(&target)?;
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM component_identities WHERE id = ?1",
                params![source_id],
            )?;
            Ok(())
        })?;

        debug!(source_id, target_id, ?report, "component identities merged");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ReviewStore {
        ReviewStore::in_memory().unwrap()
    }

    fn key(value: &str) -> ReviewKey {
        ReviewKey::enum_value("mice", "sensor_type", value)
    }

    fn accept(value: &str) -> LaneAction {
        LaneAction::Accept {
            selected_value: value.to_string(),
            selected_candidate_id: Some(format!("cand-{value}")),
        }
    }

    #[test]
    fn test_confirm_never_touches_selection_or_accept() {
        let s = store();
        let k = key("optical");
        s.apply_shared_lane_state(&k, &accept("Optical")).unwrap();
        let row = s.apply_shared_lane_state(&k, &LaneAction::Confirm).unwrap();

        assert_eq!(row.ai_confirm_shared_status, ConfirmStatus::Confirmed);
        assert_eq!(row.selected_value.as_deref(), Some("Optical"));
        assert_eq!(row.user_accept_shared_status, Some(true));
    }

    #[test]
    fn test_accept_same_selection_keeps_confirmation() {
        let s = store();
        let k = key("optical");
        s.apply_shared_lane_state(&k, &accept("Optical")).unwrap();
        s.apply_shared_lane_state(&k, &LaneAction::Confirm).unwrap();

        let row = s.apply_shared_lane_state(&k, &accept("Optical")).unwrap();
        assert_eq!(row.ai_confirm_shared_status, ConfirmStatus::Confirmed);
        assert_eq!(row.user_accept_shared_status, Some(true));
    }

    #[test]
    fn test_accept_changed_selection_resets_confirmation() {
        let s = store();
        let k = key("optical");
        s.apply_shared_lane_state(&k, &accept("Optical")).unwrap();
        s.apply_shared_lane_state(&k, &LaneAction::Confirm).unwrap();

        let row = s.apply_shared_lane_state(&k, &accept("Laser")).unwrap();
        assert_eq!(row.ai_confirm_shared_status, ConfirmStatus::Pending);
        assert_eq!(row.selected_value.as_deref(), Some("Laser"));
        assert_eq!(row.user_accept_shared_status, Some(true));
    }

    #[test]
    fn test_policy_transition_reevaluates_rows() {
        let s = store();
        let known = KnownValueSet::closed(&["Optical", "Laser"]);

        for value in ["optical", "hall effect"] {
            let mut row = ReviewRow::pending(key(value));
            row.enum_policy = Some(EnumPolicy::OpenPreferKnown);
            s.upsert_row(&row).unwrap();
        }
        let mut manual_row = ReviewRow::pending(key("bespoke"));
        manual_row.manual = true;
        manual_row.enum_policy = Some(EnumPolicy::OpenPreferKnown);
        s.upsert_row(&manual_row).unwrap();

        let updated = s
            .apply_enum_policy_transition("mice", "sensor_type", EnumPolicy::Closed, &known)
            .unwrap();
        assert_eq!(updated, 2);

        let optical = s.get_row(&key("optical")).unwrap().unwrap();
        assert_eq!(optical.enum_policy, Some(EnumPolicy::Closed));
        assert!(!optical.needs_review);

        let hall = s.get_row(&key("hall effect")).unwrap().unwrap();
        assert_eq!(hall.enum_policy, Some(EnumPolicy::Closed));
        assert!(hall.needs_review);

        // Manual rows are immune.
        let manual = s.get_row(&key("bespoke")).unwrap().unwrap();
        assert_eq!(manual.enum_policy, Some(EnumPolicy::OpenPreferKnown));
        assert!(!manual.needs_review);
    }

    #[test]
    fn test_policy_transition_back_to_open_clears_review() {
        let s = store();
        let known = KnownValueSet::closed(&["Optical"]);
        s.upsert_row(&ReviewRow::pending(key("hall effect"))).unwrap();

        s.apply_enum_policy_transition("mice", "sensor_type", EnumPolicy::Closed, &known)
            .unwrap();
        assert!(s.get_row(&key("hall effect")).unwrap().unwrap().needs_review);

        s.apply_enum_policy_transition(
            "mice",
            "sensor_type",
            EnumPolicy::OpenPreferKnown,
            &known,
        )
        .unwrap();
        let row = s.get_row(&key("hall effect")).unwrap().unwrap();
        assert_eq!(row.enum_policy, Some(EnumPolicy::OpenPreferKnown));
        assert!(!row.needs_review);
    }

    fn identity(id: &str, name: &str, values: &[(&str, &str)]) -> ComponentIdentity {
        ComponentIdentity {
            id: id.to_string(),
            category: "mice".into(),
            display_name: name.to_string(),
            aliases: Vec::new(),
            links: Vec::new(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_merge_target_wins_collisions_and_transfers_exclusives() {
        let s = store();
        s.upsert_identity(&identity(
            "cmp-a",
            "PAW3950",
            &[("dpi", "32000"), ("ips", "750")],
        ))
        .unwrap();
        s.upsert_identity(&identity("cmp-b", "PixArt PAW3950", &[("dpi", "35000")]))
            .unwrap();

        let report = s.merge_component_identities("cmp-b", "cmp-a").unwrap();
        assert_eq!(report.values_kept_from_target, 1);

        let merged = s.get_identity("cmp-a").unwrap().unwrap();
        assert_eq!(merged.values["dpi"], "32000");
        assert_eq!(merged.values["ips"], "750");
        assert!(merged.aliases.contains(&"PixArt PAW3950".to_string()));
        assert!(s.get_identity("cmp-b").unwrap().is_none());
    }

    #[test]
    fn test_merge_rewrites_review_rows_and_keeps_progress() {
        let s = store();
        s.upsert_identity(&identity("cmp-a", "PAW3950", &[])).unwrap();
        s.upsert_identity(&identity("cmp-b", "PAW3950 clone", &[("dpi", "35000")]))
            .unwrap();

        // Source has a confirmed row; target's colliding row is pending but
        // user-accepted.
        let source_key = ReviewKey::component_property("mice", "sensor", "cmp-b", "dpi");
        s.apply_shared_lane_state(&source_key, &LaneAction::Confirm).unwrap();

        let target_key = ReviewKey::component_property("mice", "sensor", "cmp-a", "dpi");
        s.apply_shared_lane_state(
            &target_key,
            &LaneAction::Accept {
                selected_value: "32000".into(),
                selected_candidate_id: None,
            },
        )
        .unwrap();

        // A source-only row transfers wholesale.
        let source_only = ReviewKey::component_property("mice", "sensor", "cmp-b", "ips");
        s.apply_shared_lane_state(&source_only, &LaneAction::Confirm).unwrap();

        let report = s.merge_component_identities("cmp-b", "cmp-a").unwrap();
        assert_eq!(report.review_rows_merged, 1);
        assert_eq!(report.review_rows_rewritten, 1);

        let merged = s.get_row(&target_key).unwrap().unwrap();
        assert_eq!(merged.ai_confirm_shared_status, ConfirmStatus::Confirmed);
        assert_eq!(merged.user_accept_shared_status, Some(true));

        let moved = s
            .get_row(&ReviewKey::component_property("mice", "sensor", "cmp-a", "ips"))
            .unwrap()
            .unwrap();
        assert_eq!(moved.ai_confirm_shared_status, ConfirmStatus::Confirmed);
        assert!(s.get_row(&source_key).unwrap().is_none());
    }

    #[test]
    fn test_merge_chain_equivalent_to_direct() {
        // merge(a<-b) then merge(a<-c) leaves the same values as merging c
        // into a directly would, up to log ordering.
        let s = store();
        s.upsert_identity(&identity("cmp-a", "A", &[("x", "1")])).unwrap();
        s.upsert_identity(&identity("cmp-b", "B", &[("y", "2")])).unwrap();
        s.upsert_identity(&identity("cmp-c", "C", &[("z", "3"), ("x", "9")]))
            .unwrap();

        s.merge_component_identities("cmp-b", "cmp-a").unwrap();
        s.merge_component_identities("cmp-c", "cmp-a").unwrap();

        let merged = s.get_identity("cmp-a").unwrap().unwrap();
        assert_eq!(merged.values["x"], "1");
        assert_eq!(merged.values["y"], "2");
        assert_eq!(merged.values["z"], "3");
        assert!(s.get_identity("cmp-b").unwrap().is_none());
        assert!(s.get_identity("cmp-c").unwrap().is_none());
    }
}

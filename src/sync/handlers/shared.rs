use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::adapter::{external_id, set_external_id, Record};
use crate::engine::{Engine, RegisteredCollection};
use crate::error::SyncResult;
use crate::sync::protocol::{ChangeKind, ChangeRecord};

/// How conflicting records in a `set_data` payload are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Payload comes from the leader and overwrites local records
    Authoritative,
    /// Payload comes from a follower; differing records under an id the
    /// leader already uses are re-inserted under a fresh id
    Collision,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub deleted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub reinserted: usize,
    pub skipped: usize,
}

impl MergeReport {
    /// Number of adapter mutations performed
    pub fn mutations(&self) -> usize {
        self.deleted + self.inserted + self.updated + self.reinserted
    }
}

impl Engine {
    /// Records with `externalId >= from` plus the changes after
    /// `change_from` (or only the latest change when unknown)
    ///
    /// Targets of update changes missing from the range are fetched and
    /// appended, unless they no longer exist.
    pub async fn collect_delta(
        &self,
        coll: &RegisteredCollection,
        from: i64,
        change_from: Option<i64>,
    ) -> SyncResult<(Vec<Record>, Vec<ChangeRecord>)> {
        let identifier = coll.identifier();
        let adapter = coll.adapter();

        let mut data = adapter.get_data(from, None).await?;
        let changes = match change_from.filter(|i| *i > 0) {
            Some(index) => self.changes.get_changes(identifier, index)?,
            None => self.changes.latest_change(identifier)?.into_iter().collect(),
        };

        for change in changes.iter().filter(|c| c.kind == ChangeKind::Update) {
            if data.iter().any(|r| external_id(r) == Some(change.id)) {
                continue;
            }
            if let Some(record) = adapter
                .get_data(change.id, Some(change.id))
                .await?
                .into_iter()
                .next()
            {
                data.push(record);
            }
        }

        Ok((data, changes))
    }

    /// Apply a mutation to the adapter and log it
    pub async fn commit(
        &self,
        coll: &RegisteredCollection,
        kind: ChangeKind,
        record: Record,
        external_id: i64,
    ) -> SyncResult<ChangeRecord> {
        let adapter = coll.adapter();
        match kind {
            ChangeKind::Insert => adapter.insert(record, external_id).await?,
            ChangeKind::Update => {
                let mut record = record;
                set_external_id(&mut record, external_id);
                adapter.update(record).await?
            }
            ChangeKind::Delete => adapter.delete(external_id).await?,
        }
        self.append_change(coll.identifier(), external_id, kind, None)
    }

    /// Merge a `set_data` payload into the local collection
    ///
    /// Deletes are applied first, then the remaining changes are logged, then
    /// each record is inserted, skipped or resolved according to `mode`.
    /// Applying the same payload twice performs no mutation the second time.
    pub async fn merge(
        &self,
        coll: &RegisteredCollection,
        data: Vec<Record>,
        changes: Vec<ChangeRecord>,
        mode: MergeMode,
    ) -> SyncResult<MergeReport> {
        let identifier = coll.identifier();
        let adapter = coll.adapter();
        let mut report = MergeReport::default();

        // Local entries from the oldest incoming index on, so each incoming
        // change is logged once
        let mut local = match changes.iter().map(|c| c.index).min() {
            Some(oldest) => self.changes.changes_from(identifier, oldest - 1)?,
            None => Vec::new(),
        };

        for change in changes.iter().filter(|c| c.kind == ChangeKind::Delete) {
            if !adapter
                .get_data(change.id, Some(change.id))
                .await?
                .is_empty()
            {
                adapter.delete(change.id).await?;
                report.deleted += 1;
            }
            self.log_incoming(identifier, &mut local, change)?;
        }

        for change in changes.iter().filter(|c| c.kind != ChangeKind::Delete) {
            self.log_incoming(identifier, &mut local, change)?;
        }

        let updated_ids: HashSet<i64> = changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Update)
            .map(|c| c.id)
            .collect();

        for mut item in data {
            let Some(id) = external_id(&item) else {
                warn!("[MERGE] Record without externalId in '{}', skipped", identifier);
                report.skipped += 1;
                continue;
            };

            let existing = adapter.get_data(id, Some(id)).await?.into_iter().next();
            let current = match existing {
                None => {
                    adapter.insert(item, id).await?;
                    report.inserted += 1;
                    continue;
                }
                Some(current) => current,
            };

            if adapter.is_equal(&current, &item) {
                report.skipped += 1;
                continue;
            }

            match mode {
                MergeMode::Authoritative => {
                    adapter.update(item).await?;
                    report.updated += 1;
                }
                MergeMode::Collision if updated_ids.contains(&id) => {
                    adapter.update(item).await?;
                    report.updated += 1;
                }
                MergeMode::Collision => {
                    // Already re-inserted by an earlier merge of this payload
                    let later = adapter.get_data(id, None).await?;
                    if later.iter().any(|r| adapter.is_equal(r, &item)) {
                        report.skipped += 1;
                        continue;
                    }

                    let new_id = adapter.latest_external_id().await? + 1;
                    set_external_id(&mut item, new_id);
                    adapter.insert(item, new_id).await?;
                    local.push(self.append_change(
                        identifier,
                        new_id,
                        ChangeKind::Insert,
                        None,
                    )?);
                    info!(
                        "[MERGE] Id collision on {}/{}: incoming record re-inserted as {}",
                        identifier, id, new_id
                    );
                    report.reinserted += 1;
                }
            }
        }

        debug!("[MERGE] {} ({:?}): {:?}", identifier, mode, report);
        Ok(report)
    }

    /// Log an incoming change unless `local` already holds it
    ///
    /// A change that found its slot taken was stored at a later index, so a
    /// matching entry at or after the incoming index counts as logged.
    fn log_incoming(
        &self,
        identifier: &str,
        local: &mut Vec<ChangeRecord>,
        change: &ChangeRecord,
    ) -> SyncResult<()> {
        let logged = local
            .iter()
            .any(|c| c.id == change.id && c.kind == change.kind && c.index >= change.index);
        if !logged {
            local.push(self.append_change(identifier, change.id, change.kind, Some(change.index))?);
        }
        Ok(())
    }
}

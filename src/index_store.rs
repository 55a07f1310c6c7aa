use std::path::Path;

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    Table,
    TableDefinition,
    WriteTransaction,
};
use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    types::{FaceEmbedding, FileId, FileMlRecord, LibraryMlData, needs_sync},
};

const FILES: TableDefinition<u64, &[u8]> = TableDefinition::new("files");
/// Compact `file id -> (ml_version, error_count)` index over `FILES`.
const SYNC_STATE: TableDefinition<u64, (u32, u32)> =
    TableDefinition::new("sync_state");
const LIBRARY: TableDefinition<&str, &[u8]> = TableDefinition::new("library");
const INDEX_VERSIONS: TableDefinition<&str, u64> =
    TableDefinition::new("index_versions");
const FACE_CROPS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("face_crops");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");
const META: TableDefinition<&str, u32> = TableDefinition::new("meta");

const LIBRARY_KEY: &str = "library";
const SCHEMA_KEY: &str = "schema_version";

/// Current on-disk layout version.
pub const SCHEMA_VERSION: u32 = 2;

/// Index version bumped whenever the set of file records changes.
pub const FILES_INDEX: &str = "files";
/// Index version bumped whenever library metadata is rewritten.
pub const LIBRARY_INDEX: &str = "library";

/// Counts over the sync-state index for a given target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncStats {
    pub total: usize,
    pub synced: usize,
    pub pending: usize,
    pub quarantined: usize,
}

/// Durable per-file ML records plus the library-wide metadata slot.
pub struct IndexStore {
    db: Database,
}

impl IndexStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(SYNC_STATE)?;
        txn.open_table(LIBRARY)?;
        txn.open_table(INDEX_VERSIONS)?;
        txn.open_table(FACE_CROPS)?;
        txn.open_table(SETTINGS)?;
        {
            let has_files = txn.open_table(FILES)?.iter()?.next().is_some();
            let mut meta = txn.open_table(META)?;
            let stored = meta.get(SCHEMA_KEY)?.map(|v| v.value());
            // Databases written before the meta table existed are v1.
            let found = stored.or(has_files.then_some(1));
            match found {
                Some(found) if found > SCHEMA_VERSION => {
                    return Err(Error::SchemaTooNew {
                        found,
                        supported: SCHEMA_VERSION,
                    });
                }
                Some(found) if found < SCHEMA_VERSION => {
                    info!(from = found, to = SCHEMA_VERSION, "migrating index");
                    migrate(&txn, found)?;
                }
                _ => {}
            }
            meta.insert(SCHEMA_KEY, SCHEMA_VERSION)?;
        }
        txn.commit()?;

        Ok(Self { db })
    }

    pub fn schema_version(&self) -> Result<u32> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        Ok(table.get(SCHEMA_KEY)?.map(|v| v.value()).unwrap_or(0))
    }

    // -- File records --

    pub fn get_all_file_ids(&self) -> Result<Vec<FileId>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SYNC_STATE)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, _v) = entry?;
            result.push(k.value());
        }
        Ok(result)
    }

    pub fn get_file(&self, file_id: FileId) -> Result<Option<FileMlRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILES)?;
        table
            .get(file_id)?
            .map(|v| decode_record(v.value()))
            .transpose()
    }

    pub fn put_file(&self, record: &FileMlRecord) -> Result<()> {
        self.put_all_files(std::slice::from_ref(record))
    }

    /// Upsert multiple records in a single transaction.
    pub fn put_all_files(&self, records: &[FileMlRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut files = txn.open_table(FILES)?;
            let mut state = txn.open_table(SYNC_STATE)?;
            for record in records {
                write_record(&mut files, &mut state, record)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Store a freshly derived record together with the crops of its faces.
    ///
    /// Crops of `record.file_id` that are not in `crops` are deleted in the
    /// same transaction, so the crop table only ever holds the faces of the
    /// stored record.
    pub fn put_file_with_crops(
        &self,
        record: &FileMlRecord,
        crops: &[(String, Vec<u8>)],
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut files = txn.open_table(FILES)?;
            let mut state = txn.open_table(SYNC_STATE)?;
            write_record(&mut files, &mut state, record)?;

            let mut table = txn.open_table(FACE_CROPS)?;
            let prefix = crate::face::face_id_prefix(record.file_id);
            for key in crop_keys(&table, &prefix)? {
                if !crops.iter().any(|(face_id, _)| *face_id == key) {
                    table.remove(key.as_str())?;
                }
            }
            for (face_id, image) in crops {
                table.insert(face_id.as_str(), image.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove records and their face crops in a single transaction.
    pub fn remove_all_files(&self, file_ids: &[FileId]) -> Result<()> {
        if file_ids.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        remove_records(&txn, file_ids)?;
        txn.commit()?;
        Ok(())
    }

    /// Ids of up to `batch_size` files that are out of sync with
    /// `target_version` and not quarantined, in ascending id order.
    pub fn get_file_ids_needing_sync(
        &self,
        batch_size: usize,
        target_version: u32,
        max_error_count: u32,
    ) -> Result<Vec<FileId>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SYNC_STATE)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let (ml_version, error_count) = v.value();
            if needs_sync(
                ml_version,
                error_count,
                target_version,
                max_error_count,
            ) {
                result.push(k.value());
                if result.len() >= batch_size {
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Read-modify-write one record inside a write transaction.
    ///
    /// redb admits one writer at a time, so concurrent updates to the same
    /// id are applied one after the other rather than overwriting each
    /// other.
    pub fn upsert_file_with<F>(
        &self,
        file_id: FileId,
        update: F,
    ) -> Result<FileMlRecord>
    where
        F: FnOnce(Option<FileMlRecord>) -> FileMlRecord,
    {
        let txn = self.db.begin_write()?;
        let record = {
            let mut files = txn.open_table(FILES)?;
            let mut state = txn.open_table(SYNC_STATE)?;
            let existing = files
                .get(file_id)?
                .map(|v| decode_record(v.value()))
                .transpose()?;
            let record = update(existing);
            write_record(&mut files, &mut state, &record)?;
            record
        };
        txn.commit()?;
        Ok(record)
    }

    /// Apply a reconcile diff atomically: insert fresh records for
    /// `new_ids`, drop `removed_ids`, and bump the files index version if
    /// anything changed.
    ///
    /// Returns the new files index version when the set changed.
    pub fn sync_local_files(
        &self,
        new_ids: &[FileId],
        removed_ids: &[FileId],
    ) -> Result<Option<u64>> {
        if new_ids.is_empty() && removed_ids.is_empty() {
            return Ok(None);
        }
        let txn = self.db.begin_write()?;
        {
            let mut files = txn.open_table(FILES)?;
            let mut state = txn.open_table(SYNC_STATE)?;
            for &file_id in new_ids {
                let record = FileMlRecord::new(file_id);
                write_record(&mut files, &mut state, &record)?;
            }
        }
        remove_records(&txn, removed_ids)?;
        let version = {
            let mut versions = txn.open_table(INDEX_VERSIONS)?;
            bump_version(&mut versions, FILES_INDEX)?
        };
        txn.commit()?;
        Ok(Some(version))
    }

    /// Return every decodable record, in id order.
    pub fn list_files(&self) -> Result<Vec<FileMlRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FILES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            match decode_record(v.value()) {
                Ok(record) => result.push(record),
                Err(e) => warn!(file_id = k.value(), "skipping record: {e}"),
            }
        }
        Ok(result)
    }

    /// Every face that carries an embedding, across all files.
    pub fn all_face_embeddings(&self) -> Result<Vec<FaceEmbedding>> {
        Ok(self
            .list_files()?
            .into_iter()
            .flat_map(|record| record.faces)
            .filter_map(|face| {
                let embedding = face.embedding?;
                Some(FaceEmbedding {
                    face_id: face.id,
                    file_id: face.file_id,
                    embedding,
                })
            })
            .collect())
    }

    pub fn sync_stats(
        &self,
        target_version: u32,
        max_error_count: u32,
    ) -> Result<SyncStats> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SYNC_STATE)?;
        let mut stats = SyncStats::default();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let (ml_version, error_count) = v.value();
            stats.total += 1;
            if ml_version == target_version {
                stats.synced += 1;
            } else if error_count >= max_error_count {
                stats.quarantined += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }

    /// Clear error state so quarantined files become eligible again.
    ///
    /// With `None` every record is reset. Returns how many records changed.
    pub fn reset_error_counts(
        &self,
        file_ids: Option<&[FileId]>,
    ) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let changed = {
            let mut files = txn.open_table(FILES)?;
            let mut state = txn.open_table(SYNC_STATE)?;
            let candidates: Vec<FileId> = match file_ids {
                Some(ids) => ids.to_vec(),
                None => {
                    let mut ids = Vec::new();
                    for entry in state.iter()? {
                        let (k, v) = entry?;
                        if v.value().1 > 0 {
                            ids.push(k.value());
                        }
                    }
                    ids
                }
            };
            let mut changed = 0;
            for file_id in candidates {
                let Some(mut record) = files
                    .get(file_id)?
                    .map(|v| decode_record(v.value()))
                    .transpose()?
                else {
                    continue;
                };
                if record.error_count == 0
                    && record.last_error_message.is_none()
                {
                    continue;
                }
                record.error_count = 0;
                record.last_error_message = None;
                write_record(&mut files, &mut state, &record)?;
                changed += 1;
            }
            changed
        };
        txn.commit()?;
        Ok(changed)
    }

    // -- Library metadata --

    pub fn get_library_data(&self) -> Result<Option<LibraryMlData>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LIBRARY)?;
        table
            .get(LIBRARY_KEY)?
            .map(|v| serde_json::from_slice(v.value()).map_err(Error::from))
            .transpose()
    }

    /// Overwrite the library slot and bump the library index version.
    pub fn put_library_data(&self, data: &LibraryMlData) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LIBRARY)?;
            table.insert(LIBRARY_KEY, bytes.as_slice())?;
            let mut versions = txn.open_table(INDEX_VERSIONS)?;
            bump_version(&mut versions, LIBRARY_INDEX)?;
        }
        txn.commit()?;
        Ok(())
    }

    // -- Index versions --

    pub fn index_version(&self, name: &str) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(INDEX_VERSIONS)?;
        Ok(table.get(name)?.map(|v| v.value()).unwrap_or(0))
    }

    pub fn increment_index_version(&self, name: &str) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let version = {
            let mut table = txn.open_table(INDEX_VERSIONS)?;
            bump_version(&mut table, name)?
        };
        txn.commit()?;
        Ok(version)
    }

    // -- Face crops --

    pub fn put_face_crop(&self, face_id: &str, image: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(FACE_CROPS)?;
            table.insert(face_id, image)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_face_crop(&self, face_id: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FACE_CROPS)?;
        Ok(table.get(face_id)?.map(|v| v.value().to_vec()))
    }

    /// Face ids of every stored crop of `file_id`.
    pub fn face_crop_ids(&self, file_id: FileId) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(FACE_CROPS)?;
        crop_keys(&table, &crate::face::face_id_prefix(file_id))
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(SETTINGS)?;
            table.remove(key)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value().to_string(), v.value().to_string()));
        }
        Ok(result)
    }
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore").finish_non_exhaustive()
    }
}

fn decode_record(bytes: &[u8]) -> Result<FileMlRecord> {
    Ok(serde_json::from_slice(bytes)?)
}

fn write_record(
    files: &mut Table<'_, u64, &'static [u8]>,
    state: &mut Table<'_, u64, (u32, u32)>,
    record: &FileMlRecord,
) -> Result<()> {
    let bytes = serde_json::to_vec(record)?;
    files.insert(record.file_id, bytes.as_slice())?;
    state.insert(record.file_id, (record.ml_version, record.error_count))?;
    Ok(())
}

fn remove_records(txn: &WriteTransaction, file_ids: &[FileId]) -> Result<()> {
    if file_ids.is_empty() {
        return Ok(());
    }
    let mut files = txn.open_table(FILES)?;
    let mut state = txn.open_table(SYNC_STATE)?;
    let mut crops = txn.open_table(FACE_CROPS)?;
    for &file_id in file_ids {
        files.remove(file_id)?;
        state.remove(file_id)?;

        let prefix = crate::face::face_id_prefix(file_id);
        for key in crop_keys(&crops, &prefix)? {
            crops.remove(key.as_str())?;
        }
    }
    Ok(())
}

/// Keys of every crop whose face id starts with `prefix`.
fn crop_keys(
    crops: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in crops.range::<&str>(prefix..)? {
        let (k, _v) = entry?;
        let key = k.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

fn bump_version(
    table: &mut Table<'_, &'static str, u64>,
    name: &str,
) -> Result<u64> {
    let next = table.get(name)?.map(|v| v.value()).unwrap_or(0) + 1;
    table.insert(name, next)?;
    Ok(next)
}

/// Bring an older layout up to [`SCHEMA_VERSION`] inside `txn`.
fn migrate(txn: &WriteTransaction, from: u32) -> Result<()> {
    if from < 2 {
        // v2 changed the pipeline enough that past failures say nothing
        // about future ones; also builds the sync-state index v1 lacked.
        let mut files = txn.open_table(FILES)?;
        let mut state = txn.open_table(SYNC_STATE)?;
        let mut records = Vec::new();
        let mut corrupt = Vec::new();
        for entry in files.iter()? {
            let (k, v) = entry?;
            match decode_record(v.value()) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(file_id = k.value(), "dropping record: {e}");
                    corrupt.push(k.value());
                }
            }
        }
        for file_id in corrupt {
            files.remove(file_id)?;
        }
        for mut record in records {
            record.error_count = 0;
            record.last_error_message = None;
            write_record(&mut files, &mut state, &record)?;
        }
    }
    Ok(())
}
